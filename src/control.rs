//! Control channel between run control and a component.
//!
//! The component dials run control, introduces itself with a [`Hello`] and
//! then answers every [`Command`] frame with exactly one [`Reply`] frame, in
//! order. Losing the connection is logged; the component keeps its state and
//! can still be driven through its [`ReceiverHandle`].
//!
//! [`RunControlListener`] is the run-control side of the same protocol. It is
//! enough to drive components from tests and simple orchestration scripts.

use crate::command::{Command, Reply};
use crate::receiver::ReceiverHandle;
use crate::state::RunState;
use crate::transport::{read_frame, write_frame, Hello, PeerKind};
use daq_core::error::{DaqError, DaqResult};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Control messages are small; anything larger is a protocol error.
pub const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

/// Connect `handle` to run control at `addr`.
///
/// Returns once the greeting is sent; commands are served by a background
/// task that ends when run control disconnects or the component terminates.
pub async fn connect_run_control(addr: &str, handle: ReceiverHandle) -> DaqResult<JoinHandle<()>> {
    let mut stream = TcpStream::connect(addr).await.map_err(|e| {
        DaqError::Disconnected(format!("cannot reach run control at {}: {}", addr, e))
    })?;
    stream.set_nodelay(true)?;
    Hello::new(handle.kind(), handle.name()).send(&mut stream).await?;
    info!(component = %handle.name(), addr, "connected to run control");

    Ok(tokio::spawn(async move {
        let name = handle.name().to_string();
        if let Err(e) = serve_commands(stream, handle).await {
            warn!(component = %name, error = %e, "control channel lost");
        }
    }))
}

/// Answer command frames from `io` until EOF or termination.
pub async fn serve_commands<S>(mut io: S, handle: ReceiverHandle) -> DaqResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = read_frame(&mut io, MAX_CONTROL_FRAME).await? else {
            info!(component = %handle.name(), "run control closed the control channel");
            return Ok(());
        };

        let reply = match Command::decode(&frame) {
            Ok(cmd) => {
                debug!(component = %handle.name(), command = %cmd, "command received");
                handle.send(cmd).await
            }
            Err(e) => {
                warn!(component = %handle.name(), error = %e, "malformed command");
                Reply::error(handle.state(), format!("malformed command: {}", e))
            }
        };

        write_frame(&mut io, &reply.encode()).await?;
        io.flush().await?;

        if reply.state == RunState::Terminated {
            debug!(component = %handle.name(), "terminated, closing control channel");
            return Ok(());
        }
    }
}

/// Run-control side: accepts components and sends them commands.
pub struct RunControlListener {
    listener: TcpListener,
}

impl RunControlListener {
    pub async fn bind(addr: &str) -> DaqResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> DaqResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next component to connect and introduce itself.
    pub async fn accept(&self) -> DaqResult<RemoteComponent> {
        let (mut stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let hello = Hello::receive(&mut stream).await?;
        if hello.kind == PeerKind::RunControl {
            return Err(DaqError::Disconnected(format!(
                "{} introduced itself as run control",
                peer
            )));
        }
        info!(component = %hello.name, kind = %hello.kind, %peer, "component connected");
        Ok(RemoteComponent { hello, stream })
    }
}

/// A component connected to run control.
pub struct RemoteComponent {
    hello: Hello,
    stream: TcpStream,
}

impl RemoteComponent {
    pub fn name(&self) -> &str {
        &self.hello.name
    }

    pub fn kind(&self) -> PeerKind {
        self.hello.kind
    }

    /// Send one command and wait for its reply.
    pub async fn command(&mut self, cmd: Command) -> DaqResult<Reply> {
        write_frame(&mut self.stream, &cmd.encode()).await?;
        self.stream.flush().await?;
        let frame = read_frame(&mut self.stream, MAX_CONTROL_FRAME)
            .await?
            .ok_or_else(|| {
                DaqError::Disconnected(format!("{} closed the control channel", self.hello.name))
            })?;
        Reply::decode(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{spawn, HookResult, Lifecycle, ReceiverContext};
    use daq_core::config::ConfigurationRef;
    use tokio::runtime::Handle;

    struct Quiet;

    impl Lifecycle for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }
        fn kind(&self) -> PeerKind {
            PeerKind::Collector
        }
        fn do_configure(&mut self, _: ConfigurationRef, _: &ReceiverContext) -> HookResult {
            Ok(())
        }
        fn do_start_run(&mut self, _: u32, _: &ReceiverContext) -> HookResult {
            Ok(())
        }
        fn do_stop_run(&mut self, _: &ReceiverContext) -> HookResult {
            Ok(())
        }
        fn do_reset(&mut self, _: &ReceiverContext) -> HookResult {
            Ok(())
        }
        fn do_terminate(&mut self, _: &ReceiverContext) -> HookResult {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_command_gets_an_error_reply() {
        let (mut rc, component) = tokio::io::duplex(1024);
        let handle = spawn(Quiet, Handle::current()).unwrap();
        let server = tokio::spawn(serve_commands(component, handle.clone()));

        write_frame(&mut rc, &[99, 0]).await.unwrap();
        let reply = Reply::decode(&read_frame(&mut rc, 1024).await.unwrap().unwrap()).unwrap();
        assert!(!reply.is_ok());
        assert!(reply.message.unwrap().contains("malformed"));

        write_frame(&mut rc, &Command::Terminate.encode()).await.unwrap();
        let reply = Reply::decode(&read_frame(&mut rc, 1024).await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.state, RunState::Terminated);

        server.await.unwrap().unwrap();
        handle.join();
    }
}
