//! The agent run loop.

use crate::dispatcher::AgentDispatcher;
use crate::launcher::NoticeReceiver;
use crate::session::BusSession;
use std::future::Future;
use tracing::{debug, error, info};

/// Serve method calls and build notices until `shutdown` resolves or the
/// session ends for good, then shut the dispatcher down.
///
/// Calls and notices are handled one at a time, so the registry is only
/// ever touched from this loop. Returns the result of
/// [`AgentDispatcher::shutdown`].
pub async fn run_agent<S, F>(
    dispatcher: &mut AgentDispatcher<S>,
    mut notices: NoticeReceiver,
    shutdown: F,
) -> bool
where
    S: BusSession,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut notices_open = true;

    info!(addr = %dispatcher.factory_addr(), "Agent running");

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }

            notice = notices.recv(), if notices_open => match notice {
                Some(notice) => dispatcher.handle_notice(notice).await,
                None => {
                    debug!("Notice channel closed");
                    notices_open = false;
                }
            },

            call = dispatcher.session_mut().next_call() => match call {
                Some(call) => dispatcher.dispatch(call).await,
                None => match dispatcher.session_mut().reconnect().await {
                    Ok(true) => continue,
                    Ok(false) => {
                        info!("Session ended");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to re-establish session");
                        break;
                    }
                },
            },
        }
    }

    dispatcher.shutdown().await
}
