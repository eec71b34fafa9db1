//! VM supervisor: boots a machine under test in a subprocess and drives it
//! through its backdoor once it answers.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::address::ConnectionSpec;
use crate::client::Machine;
use crate::config::ClientConfig;
use crate::console::{self, ConsoleSink};
use crate::error::{Error, Result};
use crate::response::CommandOutput;
use crate::transport::RetryPolicy;

/// How long [`VmHandle::shutdown`] waits for the console to drain.
const CONSOLE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of a supervised VM.
///
/// Spawning and booting both happen inside [`VmBuilder::launch`], which
/// returns a handle that is already [`Ready`](VmState::Ready).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum VmState {
    /// Subprocess runs; the backdoor has not answered yet.
    Booting,
    /// The backdoor accepted a connection.
    Ready,
    /// Subprocess exited.
    Terminated,
}

/// Builder for a supervised VM.
///
/// Defaults: `qemu-system-x86_64`, 1024 MiB RAM, KVM on, headless console,
/// backdoor reached on `127.0.0.1:<host_port>`, up to 60 connection
/// retries one second apart.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> mixos::Result<()> {
/// use mixos::{TracingSink, VmBuilder};
///
/// let mut vm = VmBuilder::new(8022, 8000)
///     .memory_mib(2048)
///     .args(["-kernel", "bzImage", "-initrd", "initrd"])
///     .launch(TracingSink)
///     .await?;
/// let out = vm.run_command(["uname", "-a"]).await?;
/// println!("{}", out.stdout_lossy());
/// vm.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
#[must_use = "a VmBuilder does nothing until .launch() is called"]
pub struct VmBuilder {
    /// Emulator executable.
    program: String,
    /// RAM size in MiB.
    memory_mib: u32,
    /// Hardware acceleration.
    kvm: bool,
    /// Host side of the backdoor port forward.
    host_port: u16,
    /// Guest port the backdoor listens on.
    guest_port: u16,
    /// Extra arguments, passed before the fixed template.
    args: Vec<String>,
    /// Where to reach the backdoor, if not the forwarded TCP port.
    backdoor: Option<ConnectionSpec>,
    /// Client settings for the embedded machine.
    config: ClientConfig,
}

impl VmBuilder {
    /// Forwards `127.0.0.1:host_port` to the guest's `guest_port`.
    pub fn new(host_port: u16, guest_port: u16) -> Self {
        Self {
            program: "qemu-system-x86_64".into(),
            memory_mib: 1024,
            kvm: true,
            host_port,
            guest_port,
            args: Vec::new(),
            backdoor: None,
            config: ClientConfig::default().retry(RetryPolicy {
                retries: 60,
                delay: Duration::from_secs(1),
            }),
        }
    }

    /// Sets the emulator executable.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Sets the RAM size in MiB (default: 1024).
    pub const fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Enables or disables KVM acceleration (default: on).
    pub const fn kvm(mut self, enable: bool) -> Self {
        self.kvm = enable;
        self
    }

    /// Appends one emulator argument (kernel, disks, ...).
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several emulator arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Reaches the backdoor at `spec` instead of the forwarded TCP port.
    pub fn backdoor(mut self, spec: ConnectionSpec) -> Self {
        self.backdoor = Some(spec);
        self
    }

    /// Replaces the embedded client's settings.
    pub const fn client_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Client settings the embedded machine will use.
    pub const fn config(&self) -> ClientConfig {
        self.config
    }

    /// Full argument list handed to the emulator.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        if self.kvm {
            argv.extend(["-enable-kvm".into(), "-cpu".into(), "host".into()]);
        }
        argv.extend([
            "-m".into(),
            self.memory_mib.to_string(),
            "-nographic".into(),
            "-nic".into(),
            format!(
                "user,model=virtio-net-pci,hostfwd=tcp:127.0.0.1:{}-:{}",
                self.host_port, self.guest_port
            ),
        ]);
        argv
    }

    /// Spawns the VM and waits until its backdoor accepts a connection.
    ///
    /// Console output is forwarded to `sink` for the lifetime of the
    /// process. Fails with [`Error::TargetTerminated`] if the process exits
    /// before the backdoor answers.
    pub async fn launch(self, sink: impl ConsoleSink) -> Result<VmHandle> {
        let argv = self.command_line();
        tracing::debug!(program = %self.program, ?argv, "launching vm");

        let mut child = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;
        tracing::info!(pid = child.id(), "vm launched");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("vm stdout was not captured"))?;
        let console = tokio::spawn(console::drain(stdout, sink));

        let spec = self.backdoor.unwrap_or_else(|| ConnectionSpec::Inet {
            host: "127.0.0.1".into(),
            port: self.host_port,
        });
        let mut handle = VmHandle {
            child,
            console,
            machine: Machine::with_config(spec, self.config),
            state: VmState::Booting,
        };
        handle.wait_ready().await?;
        Ok(handle)
    }
}

/// A running VM and the client attached to its backdoor.
///
/// The process is killed when the handle is dropped.
#[derive(Debug)]
pub struct VmHandle {
    /// Emulator process.
    child: Child,
    /// Console-draining task; ends when the console stream does.
    console: JoinHandle<()>,
    /// Client for the backdoor.
    machine: Machine,
    /// Last observed lifecycle state.
    state: VmState,
}

impl VmHandle {
    /// Last observed lifecycle state.
    pub const fn state(&self) -> VmState {
        self.state
    }

    /// OS process ID, while the process runs.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// The embedded backdoor client.
    pub const fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Checks process liveness and updates the state.
    pub fn refresh(&mut self) -> Result<VmState> {
        if self.state != VmState::Terminated {
            if let Some(status) = self.child.try_wait()? {
                self.mark_terminated(status);
            }
        }
        Ok(self.state)
    }

    /// Runs a command on the VM.
    ///
    /// Fails with [`Error::TargetTerminated`] once the process has exited.
    pub async fn run_command<I, A>(&mut self, command: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.ensure_running()?;
        let result = self.machine.run_command(command).await;
        match result {
            Err(e) if !e.is_remote() && !matches!(e, Error::EmptyCommand) => {
                // The process may have died under us.
                self.ensure_running()?;
                Err(e)
            }
            other => other,
        }
    }

    /// Waits for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.mark_terminated(status);
        Ok(status)
    }

    /// Closes the backdoor connection, kills the process, and waits for the
    /// console to drain.
    pub async fn shutdown(self) -> Result<ExitStatus> {
        let Self {
            mut child,
            mut console,
            mut machine,
            ..
        } = self;

        if let Err(e) = machine.close().await {
            tracing::debug!(error = %e, "closing backdoor connection failed");
        }
        if child.try_wait()?.is_none() {
            child.start_kill()?;
        }
        let status = child.wait().await?;
        tracing::info!(%status, "vm terminated");

        if tokio::time::timeout(CONSOLE_GRACE, &mut console).await.is_err() {
            tracing::debug!("console still open after exit, detaching");
            console.abort();
        }
        Ok(status)
    }

    /// Connects to the backdoor while watching for early process exit.
    async fn wait_ready(&mut self) -> Result<()> {
        let session = tokio::select! {
            session = self.machine.connect() => session?,
            status = self.child.wait() => {
                let status = status?;
                self.state = VmState::Terminated;
                return Err(Error::TargetTerminated(format!("exited while booting: {status}")));
            }
        };
        self.machine.adopt(session);
        self.state = VmState::Ready;
        tracing::info!("vm ready");
        Ok(())
    }

    /// Fails with [`Error::TargetTerminated`] if the process has exited.
    fn ensure_running(&mut self) -> Result<()> {
        if self.refresh()? == VmState::Terminated {
            return Err(Error::TargetTerminated("vm is no longer running".into()));
        }
        Ok(())
    }

    /// Records process exit.
    fn mark_terminated(&mut self, status: ExitStatus) {
        tracing::info!(%status, "vm exited");
        self.state = VmState::Terminated;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// A `sh -c` stand-in for the emulator; the template lands in `$@`.
    fn fake_vm(port: u16, script: &str) -> VmBuilder {
        VmBuilder::new(port, 8000)
            .program("/bin/sh")
            .kvm(false)
            .args(["-c", script, "fake-vm"])
            .client_config(ClientConfig::default().retry(RetryPolicy {
                retries: 200,
                delay: Duration::from_millis(25),
            }))
    }

    /// Collects console lines for later inspection.
    fn collector() -> (Arc<Mutex<Vec<String>>>, impl ConsoleSink) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let lines = Arc::clone(&lines);
            move |line: &str| lines.lock().unwrap().push(line.to_owned())
        };
        (lines, sink)
    }

    /// Reserves a loopback port with nothing listening on it.
    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    #[test]
    fn command_line_template() {
        let argv = VmBuilder::new(2222, 8000)
            .memory_mib(512)
            .args(["-kernel", "bzImage"])
            .command_line();
        assert_eq!(&argv[..2], ["-kernel", "bzImage"]);
        assert!(argv.contains(&"-enable-kvm".to_owned()));
        assert!(argv.contains(&"-nographic".to_owned()));
        let mem = argv.iter().position(|a| a == "-m").unwrap();
        assert_eq!(argv[mem + 1], "512");
        assert!(argv.last().unwrap().contains("hostfwd=tcp:127.0.0.1:2222-:8000"));

        let plain = VmBuilder::new(1, 2).kvm(false).command_line();
        assert!(!plain.contains(&"-enable-kvm".to_owned()));
    }

    #[tokio::test]
    async fn boots_runs_and_forwards_console() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backdoor = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut byte = [0u8; 1];
            while stream.read_exact(&mut byte).await.is_ok() && byte[0] != 0 {
                req.push(byte[0]);
            }
            stream
                .write_all(b"{\"result\":{\"run_command\":{\"exit_code\":0,\"stdout\":[111,107],\"stderr\":[]}}}\0")
                .await
                .unwrap();
            req
        });

        let lines = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let sink = {
            let lines = Arc::clone(&lines);
            let mut ready_tx = Some(ready_tx);
            move |line: &str| {
                lines.lock().unwrap().push(line.to_owned());
                if line == "ready" {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
        };
        let mut vm = fake_vm(port, "echo booting; printf 'bad\\377byte\\n'; echo ready; exec sleep 30")
            .launch(sink)
            .await
            .unwrap();
        assert_eq!(vm.state(), VmState::Ready);

        let out = vm.run_command(["uname"]).await.unwrap();
        assert_eq!(out.stdout_lossy(), "ok");
        assert_eq!(
            backdoor.await.unwrap(),
            br#"{"run_command":{"command":["uname"]}}"#.to_vec()
        );

        // The backdoor answers independently of the script; let it finish
        // printing before the process is killed.
        tokio::time::timeout(Duration::from_secs(10), ready_rx)
            .await
            .unwrap()
            .unwrap();
        let status = vm.shutdown().await.unwrap();
        assert!(!status.success());
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l == "booting"));
        assert!(lines.iter().any(|l| l == "badbyte"));
        assert!(lines.iter().any(|l| l == "ready"));
    }

    #[tokio::test]
    async fn exit_during_boot_is_target_terminated() {
        let port = free_port().await;
        let (lines, sink) = collector();
        match fake_vm(port, "echo kernel panic; exit 3").launch(sink).await {
            Err(Error::TargetTerminated(msg)) => assert!(msg.contains('3'), "{msg}"),
            other => panic!("expected TargetTerminated, got {other:?}"),
        }
        // The console task outlives the failed launch and sees the output.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*lines.lock().unwrap(), ["kernel panic"]);
    }

    #[tokio::test]
    async fn commands_after_exit_fail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move {
            let conn = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
        });

        let mut vm = fake_vm(port, "exec sleep 0.2")
            .launch(|_: &str| {})
            .await
            .unwrap();
        vm.wait().await.unwrap();
        assert_eq!(vm.state(), VmState::Terminated);
        assert!(matches!(
            vm.run_command(["true"]).await,
            Err(Error::TargetTerminated(_))
        ));
    }

    #[tokio::test]
    async fn missing_emulator_is_spawn_error() {
        let result = VmBuilder::new(1, 2)
            .program("/nonexistent/qemu-system-x86_64")
            .launch(|_: &str| {})
            .await;
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }
}
