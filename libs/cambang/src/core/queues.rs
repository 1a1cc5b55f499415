// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Bounded command ingress.
//!
//! Host threads enqueue through a [`CommandSender`]; the enqueue never
//! blocks. Once the core accepts `shutdown()`, the sender gate closes and
//! every later submit is refused with `ShuttingDown` before touching the
//! queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::commands::Command;
use super::error::{CoreError, Result};

/// Multi-producer handle feeding the core's command queue.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
    gate: Arc<AtomicBool>,
}

impl CommandSender {
    /// Non-blocking enqueue. `QueueFull` when at capacity, `ShuttingDown`
    /// once shutdown was accepted.
    pub fn submit(&self, command: Command) -> Result<()> {
        if self.gate.load(Ordering::Acquire) {
            command.op.reject_shutting_down();
            return Err(CoreError::ShuttingDown);
        }
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                tracing::warn!(command = command.op.name(), "command queue full");
                Err(CoreError::QueueFull)
            }
            Err(TrySendError::Disconnected(command)) => {
                command.op.reject_shutting_down();
                Err(CoreError::ShuttingDown)
            }
        }
    }
}

/// Build the bounded command queue plus the core-side shutdown gate.
pub(crate) fn command_channel(
    capacity: usize,
) -> (CommandSender, Receiver<Command>, Arc<AtomicBool>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let gate = Arc::new(AtomicBool::new(false));
    (
        CommandSender {
            tx,
            gate: Arc::clone(&gate),
        },
        rx,
        gate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::commands::CommandOp;

    fn noop_command() -> Command {
        Command {
            correlation_id: 1,
            op: CommandOp::EnumerateEndpoints { reply: None },
        }
    }

    #[test]
    fn test_submit_and_receive() {
        let (sender, rx, _gate) = command_channel(4);
        sender.submit(noop_command()).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_full_is_reported() {
        let (sender, _rx, _gate) = command_channel(1);
        sender.submit(noop_command()).unwrap();
        assert_eq!(sender.submit(noop_command()), Err(CoreError::QueueFull));
    }

    #[test]
    fn test_gate_refuses_after_shutdown() {
        let (sender, rx, gate) = command_channel(4);
        gate.store(true, Ordering::Release);
        assert_eq!(sender.submit(noop_command()), Err(CoreError::ShuttingDown));
        assert!(rx.try_recv().is_err());
    }
}
