use std::io;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::watch;

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// After the timeout the system will shut down regardless of what the receivers of this message
/// do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a service about an upcoming shutdown.
///
/// Obtain one through [`Controller::shutdown_handle`], or create a private one together with a
/// [`ShutdownTrigger`] through [`shutdown_channel`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the current shutdown state.
    pub fn get(&self) -> Option<Shutdown> {
        self.0.borrow().clone()
    }

    /// Wait for a shutdown.
    ///
    /// This receives all shutdown signals since the [`Controller`] has been started, even before
    /// this shutdown handle has been obtained.
    ///
    /// # Cancellation
    ///
    /// This method is cancellation safe and can be used in `select!`.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = self.0.borrow_and_update().as_ref() {
                return shutdown.clone();
            }

            if self.0.changed().await.is_err() {
                // The trigger is gone, so no shutdown will ever be signaled.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Signals a shutdown to all [`ShutdownHandle`]s created from it.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<Option<Shutdown>>);

impl ShutdownTrigger {
    /// Signals a shutdown with the given timeout.
    ///
    /// Only the first shutdown is delivered, later calls are ignored.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        self.0.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(Shutdown { timeout });
            true
        });
    }

    /// Creates a new handle that observes this trigger.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.0.subscribe())
    }
}

/// Creates a connected [`ShutdownTrigger`] and [`ShutdownHandle`] independent of the global
/// [`Controller`].
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownHandle) {
    let (tx, rx) = watch::channel(None);
    (ShutdownTrigger(tx), ShutdownHandle(rx))
}

/// The process-wide shutdown trigger.
static SHUTDOWN: Lazy<ShutdownTrigger> = Lazy::new(|| shutdown_channel().0);

/// Service to start and gracefully stop the system runtime.
///
/// This service offers a static API to wait for a shutdown signal or manually initiate the
/// shutdown. To use this functionality, it first needs to be started with [`Controller::start`].
///
/// To shut down gracefully, other services can register with [`Controller::shutdown_handle`].
/// When a shutdown signal is sent to the process, they receive a [`Shutdown`] with an optional
/// timeout.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
///
/// use tally_system::{Controller, Service, Receiver};
///
/// struct MyService;
///
/// impl Service for MyService {
///     type Interface = ();
///
///     async fn run(self, mut rx: Receiver<Self::Interface>) {
///         let mut shutdown = Controller::shutdown_handle();
///
///         loop {
///             tokio::select! {
///                 shutdown = shutdown.notified() => break, // Handle shutdown here
///                 Some(message) = rx.recv() => (),         // Process incoming message
///             }
///         }
///     }
/// }
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     // Start the controller near the beginning of application bootstrap. This allows other
///     // services to register for shutdown messages.
///     Controller::start(Duration::from_millis(10));
///
///     // Start the service. It will register itself for shutdowns.
///     MyService.start_detached();
///
///     // The controller now listens for signals and forwards them to services. To trigger a
///     // graceful shutdown manually, use `shutdown`.
///     Controller::shutdown(None);
/// }
/// ```
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts a controller that monitors shutdown signals.
    ///
    /// `SIGTERM` triggers a graceful shutdown with the given timeout, `SIGINT` an immediate one.
    pub fn start(shutdown_timeout: Duration) {
        tokio::spawn(async move {
            match monitor_shutdown(shutdown_timeout).await {
                Ok(shutdown) => {
                    SHUTDOWN.shutdown(shutdown.timeout);
                }
                Err(error) => {
                    tally_log::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to listen for shutdown signals"
                    );
                }
            }
        });
    }

    /// Manually initiates the shutdown process of the system.
    pub fn shutdown(timeout: Option<Duration>) {
        SHUTDOWN.shutdown(timeout);
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        SHUTDOWN.handle()
    }
}

#[cfg(unix)]
async fn monitor_shutdown(timeout: Duration) -> io::Result<Shutdown> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    let timeout = tokio::select! {
        biased;

        Some(()) = sig_int.recv() => {
            tally_log::info!("SIGINT received, exiting");
            None
        }
        Some(()) = sig_quit.recv() => {
            tally_log::info!("SIGQUIT received, exiting");
            None
        }
        Some(()) = sig_term.recv() => {
            tally_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
            Some(timeout)
        }
    };

    Ok(Shutdown { timeout })
}

#[cfg(windows)]
async fn monitor_shutdown(timeout: Duration) -> io::Result<Shutdown> {
    use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close};

    let mut ctrl_c = ctrl_c()?;
    let mut ctrl_break = ctrl_break()?;
    let mut ctrl_close = ctrl_close()?;

    let timeout = tokio::select! {
        biased;

        Some(()) = ctrl_c.recv() => {
            tally_log::info!("CTRL-C received, exiting");
            None
        }
        Some(()) = ctrl_break.recv() => {
            tally_log::info!("CTRL-BREAK received, exiting");
            None
        }
        Some(()) = ctrl_close.recv() => {
            tally_log::info!("CTRL-CLOSE received, stopping in {}s", timeout.as_secs());
            Some(timeout)
        }
    };

    Ok(Shutdown { timeout })
}
