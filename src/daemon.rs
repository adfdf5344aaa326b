use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};

use crate::engine::reclaimer::reclaimer_loop;
use crate::engine::receiver::receiver_loop;
use crate::engine::sender::sender_loop;
use crate::engine::{Shutdown, Wire};
use crate::error::Result;
use crate::ipc::server::control_loop;
use crate::liveness::{LivenessProbe, SignalProbe};
use crate::loss::{LossModel, RandomLoss};
use crate::store::StoreHandle;

/// The protocol engine: sender, receiver and reclaimer threads running
/// against one segment store, plus the control socket client processes
/// attach through, if one was asked for. Dropping it stops and joins them.
pub struct Daemon {
    shutdown: Shutdown,
    threads: Vec<thread::JoinHandle<()>>,
    control: Option<PathBuf>,
}

pub struct DaemonBuilder {
    store: StoreHandle,
    loss: Arc<dyn LossModel>,
    probe: Arc<dyn LivenessProbe>,
    control: Option<PathBuf>,
}

impl DaemonBuilder {
    pub fn loss_model(mut self, loss: impl LossModel + 'static) -> Self {
        self.loss = Arc::new(loss);
        self
    }

    pub fn liveness_probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Let other processes attach through a Unix socket at `path`.
    pub fn control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control = Some(path.into());
        self
    }

    pub fn start(self) -> Result<Daemon> {
        let listener = match &self.control {
            Some(path) => Some(listen(path)?),
            None => None,
        };
        let shutdown = Shutdown::default();
        let mut daemon = Daemon {
            shutdown: shutdown.clone(),
            threads: Vec::with_capacity(4),
            control: self.control,
        };
        let wire = Wire::new(self.store.shared.clone(), self.loss);

        // on a spawn failure, dropping `daemon` joins whatever already started
        daemon.threads.push({
            let (wire, shutdown) = (wire.clone(), shutdown.clone());
            thread::Builder::new()
                .name("ktp-sender".into())
                .spawn(move || sender_loop(wire, shutdown))?
        });
        daemon.threads.push({
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("ktp-receiver".into())
                .spawn(move || receiver_loop(wire, shutdown))?
        });
        daemon.threads.push({
            let shared = self.store.shared.clone();
            let (probe, shutdown) = (self.probe, shutdown.clone());
            thread::Builder::new()
                .name("ktp-reclaimer".into())
                .spawn(move || reclaimer_loop(shared, probe, shutdown))?
        });
        if let Some(listener) = listener {
            let store = self.store;
            daemon.threads.push(
                thread::Builder::new()
                    .name("ktp-control".into())
                    .spawn(move || control_loop(listener, store, shutdown))?,
            );
        }

        info!("daemon started");
        Ok(daemon)
    }
}

impl Daemon {
    /// Start with the default random loss model and the `kill(2)` probe.
    pub fn start(store: &StoreHandle) -> Result<Daemon> {
        Daemon::builder(store).start()
    }

    pub fn builder(store: &StoreHandle) -> DaemonBuilder {
        DaemonBuilder {
            store: store.clone(),
            loss: Arc::new(RandomLoss),
            probe: Arc::new(SignalProbe),
            control: None,
        }
    }

    /// Stop every engine and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown.trigger();
        for t in self.threads.drain(..) {
            let name = t.thread().name().unwrap_or("ktp-engine").to_string();
            if t.join().is_err() {
                error!("{} panicked", name);
            }
        }
        if let Some(path) = self.control.take() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("removing {}: {}", path.display(), e);
            }
        }
        info!("daemon stopped");
    }
}

/// Bind the control socket, replacing one a dead daemon left behind.
fn listen(path: &Path) -> Result<UnixListener> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => fs::remove_file(path)?,
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path.display()),
            )
            .into())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    info!("control socket at {}", path.display());
    Ok(listener)
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}
