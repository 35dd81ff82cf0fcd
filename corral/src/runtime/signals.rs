//! Unix signal handling for a running supervisor.
//!
//! | Signal  | Intent                                  |
//! |---------|-----------------------------------------|
//! | SIGHUP  | [`ControlIntent::Reload`]               |
//! | SIGTERM | [`ControlIntent::GracefulShutdown`]     |
//! | SIGINT  | [`ControlIntent::ImmediateShutdown`]    |
//! | SIGQUIT | [`ControlIntent::ImmediateShutdown`]    |
//! | SIGTTIN | [`ScaleRequest::By`] `(1)`              |
//! | SIGTTOU | [`ScaleRequest::By`] `(-1)`             |

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::supervisor::{ControlIntent, ScaleRequest, SupervisorHandle};

/// Map a received signal to the intent it requests.
pub fn intent_for(kind: SignalKind) -> Option<ControlIntent> {
    if kind == SignalKind::hangup() {
        Some(ControlIntent::Reload)
    } else if kind == SignalKind::terminate() {
        Some(ControlIntent::GracefulShutdown { timeout: None })
    } else if kind == SignalKind::interrupt() || kind == SignalKind::quit() {
        Some(ControlIntent::ImmediateShutdown)
    } else if kind == SignalKind::from_raw(SIGTTIN) {
        Some(ControlIntent::Scale(ScaleRequest::By(1)))
    } else if kind == SignalKind::from_raw(SIGTTOU) {
        Some(ControlIntent::Scale(ScaleRequest::By(-1)))
    } else {
        None
    }
}

// Same numbers on Linux and the BSDs.
const SIGTTIN: i32 = 21;
const SIGTTOU: i32 = 22;

/// Install handlers for every mapped signal and forward them to `handle`.
///
/// The listener exits after forwarding a shutdown intent, or when the
/// supervisor stops accepting intents.
pub fn spawn_signal_listener(handle: SupervisorHandle) -> anyhow::Result<JoinHandle<()>> {
    let mut hup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut ttin = signal(SignalKind::from_raw(SIGTTIN))?;
    let mut ttou = signal(SignalKind::from_raw(SIGTTOU))?;

    Ok(tokio::spawn(async move {
        loop {
            let (name, kind) = tokio::select! {
                Some(()) = hup.recv() => ("SIGHUP", SignalKind::hangup()),
                Some(()) = term.recv() => ("SIGTERM", SignalKind::terminate()),
                Some(()) = int.recv() => ("SIGINT", SignalKind::interrupt()),
                Some(()) = quit.recv() => ("SIGQUIT", SignalKind::quit()),
                Some(()) = ttin.recv() => ("SIGTTIN", SignalKind::from_raw(SIGTTIN)),
                Some(()) = ttou.recv() => ("SIGTTOU", SignalKind::from_raw(SIGTTOU)),
                else => break,
            };

            let Some(intent) = intent_for(kind) else {
                continue;
            };
            let terminal = matches!(
                intent,
                ControlIntent::GracefulShutdown { .. } | ControlIntent::ImmediateShutdown
            );
            info!(signal = name, ?intent, "received signal");

            if let Err(err) = handle.send(intent).await {
                warn!(signal = name, error = %err, "supervisor no longer accepting intents");
                break;
            }
            if terminal {
                break;
            }
        }
    }))
}
