//! The external SSH transport subprocess and the circuit breaker the
//! health endpoint reads.

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;

/// Breaker tracking whether the SSH transport is serving. Closed means
/// current flows: the transport is up.
pub struct Circuit {
    closed: AtomicBool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    /// A new circuit starts open; the transport closes it once serving.
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Run the configured transport command for the life of the server,
/// closing the circuit while it serves. The transport never exits on its
/// own in normal operation, so returning is always an error.
pub async fn serve(command: &str, circuit: Arc<Circuit>) -> Result<()> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .context("transport command is empty")?
        .to_string();
    let args: Vec<&str> = parts.collect();

    tracing::info!(%command, "starting SSH transport");
    let mut child = Command::new(&program)
        .args(&args)
        .spawn()
        .with_context(|| format!("spawning SSH transport [{command}]"))?;

    circuit.close();
    let status = child.wait().await.context("waiting for SSH transport")?;
    circuit.open();
    bail!("SSH transport exited unexpectedly with {status}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_starts_open_and_toggles() {
        let circuit = Circuit::new();
        assert!(!circuit.is_closed());
        circuit.close();
        assert!(circuit.is_closed());
        circuit.open();
        assert!(!circuit.is_closed());
    }

    #[tokio::test]
    async fn transport_exit_is_an_error_and_reopens_the_circuit() {
        let circuit = Arc::new(Circuit::new());
        let err = serve("true", circuit.clone()).await.unwrap_err();
        assert!(err.to_string().contains("exited unexpectedly"));
        assert!(!circuit.is_closed());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let circuit = Arc::new(Circuit::new());
        assert!(serve("", circuit).await.is_err());
    }
}
