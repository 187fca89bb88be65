use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatcherError>;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("dispatcher is stopping or already stopped")]
    Stopping,

    #[error("unable to spawn the dispatch thread: {0}")]
    Io(#[from] std::io::Error),
}
