use crate::assets::{TriMesh, load_obj};
use anyhow::{Error, Result};
use std::path::PathBuf;
use std::thread;
use tracing::{Level, debug, span};

/// Loads the head model off the render thread.
///
/// The result is picked up with [`ModelLoader::poll`]; until then the
/// renderer keeps the face group in its pending state.
pub struct ModelLoader {
    rx: flume::Receiver<Result<TriMesh>>,
}

impl ModelLoader {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        let (tx, rx) = flume::bounded(1);
        thread::Builder::new()
            .name("model-loader".to_string())
            .spawn(move || {
                let span = span!(Level::DEBUG, "load_head_model");
                let _guard = span.enter();
                debug!("Loading head model from {path:?}");
                // Receiver gone means the renderer was dropped first.
                let _ = tx.send(load_obj(&path));
            })?;
        Ok(Self { rx })
    }

    /// A loader whose result is already known.
    pub fn resolved(result: Result<TriMesh>) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    /// A loader that never finishes.
    pub fn never() -> (Self, flume::Sender<Result<TriMesh>>) {
        let (tx, rx) = flume::bounded(1);
        (Self { rx }, tx)
    }

    /// Blocks until the load finishes.
    pub fn wait(&self) -> Result<TriMesh> {
        self.rx
            .recv()
            .map_err(|_| Error::msg("Model loader exited without a result"))?
    }

    /// Takes the load result if it has arrived.
    pub fn poll(&self) -> Option<Result<TriMesh>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => {
                Some(Err(Error::msg("Model loader exited without a result")))
            }
        }
    }
}
