//! `mixos run` and `mixos boot`.

use std::process::ExitStatus;
use std::time::Duration;

use anyhow::Result;
use mixos::{
    ClientConfig, CommandOutput, Dialect, Machine, SessionMode, TracingSink, VmBuilder,
};

/// Options shared by every subcommand that talks to a backdoor.
#[derive(clap::Args)]
pub struct ClientArgs {
    /// Envelope revision spoken by the backdoor (flat or tagged).
    #[arg(long, default_value_t = Dialect::Flat)]
    dialect: Dialect,

    /// Connection attempts after the first one fails.
    #[arg(long)]
    retries: Option<u32>,

    /// Pause between connection attempts, in milliseconds.
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Bound on each connect attempt and on the command itself, in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Open a fresh connection per command (one-shot backdoors).
    #[arg(long)]
    per_command: bool,
}

impl ClientArgs {
    /// Overlays the flags onto `base`.
    fn config(&self, base: ClientConfig) -> ClientConfig {
        let mut retry = base.retry;
        if let Some(n) = self.retries {
            retry.retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            retry.delay = Duration::from_millis(ms);
        }
        let mut config = base.dialect(self.dialect).retry(retry);
        if self.per_command {
            config = config.session(SessionMode::PerCommand);
        }
        if let Some(secs) = self.timeout {
            config = config.timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Arguments for `mixos run`.
///
/// Usage: `mixos run [OPTIONS] -a ADDRESS COMMAND [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    /// Backdoor address: vsock:<cid>:<port>, /path/to/socket, or host:port.
    #[arg(short = 'a', long)]
    address: String,

    #[command(flatten)]
    client: ClientArgs,

    /// Command and arguments to run on the machine.
    #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    pub async fn run(self) -> Result<CommandOutput> {
        let config = self.client.config(ClientConfig::default());
        let mut machine = Machine::from_descriptor(&self.address, config)?;
        let out = machine.run_command(self.command).await;
        if let Err(e) = machine.close().await {
            tracing::debug!(error = %e, "closing connection failed");
        }
        Ok(out?)
    }
}

/// Arguments for `mixos boot`.
///
/// Usage: `mixos boot [OPTIONS] COMMAND [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct BootArgs {
    /// Emulator executable.
    #[arg(long, default_value = "qemu-system-x86_64")]
    qemu: String,

    /// Memory in MiB.
    #[arg(long, short = 'm', default_value_t = 1024)]
    memory: u32,

    /// Run without KVM acceleration.
    #[arg(long)]
    no_kvm: bool,

    /// Host port forwarded to the backdoor.
    #[arg(long, default_value_t = 8022)]
    host_port: u16,

    /// Guest port the backdoor listens on.
    #[arg(long, default_value_t = 8000)]
    guest_port: u16,

    /// Extra emulator argument (repeatable), e.g. --qemu-arg=-kernel --qemu-arg=bzImage.
    #[arg(long = "qemu-arg", allow_hyphen_values = true)]
    qemu_args: Vec<String>,

    #[command(flatten)]
    client: ClientArgs,

    /// Command and arguments to run once the VM is up.
    #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
    command: Vec<String>,
}

impl BootArgs {
    pub async fn run(self) -> Result<CommandOutput> {
        let builder = VmBuilder::new(self.host_port, self.guest_port);
        let config = self.client.config(builder.config());
        let mut vm = builder
            .program(self.qemu)
            .memory_mib(self.memory)
            .kvm(!self.no_kvm)
            .args(self.qemu_args)
            .client_config(config)
            .launch(TracingSink)
            .await?;

        let out = vm.run_command(self.command).await;
        finish(out, vm.shutdown().await)
    }
}

/// Keeps the command's result even when tearing the VM down failed.
fn finish(
    out: mixos::Result<CommandOutput>,
    shutdown: mixos::Result<ExitStatus>,
) -> Result<CommandOutput> {
    match shutdown {
        Ok(status) => tracing::debug!(%status, "vm shut down"),
        Err(e) => tracing::warn!(error = %e, "vm shutdown failed"),
    }
    Ok(out?)
}
