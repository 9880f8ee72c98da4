use std::{error::Error, fmt::Display, sync::mpsc};

/// Things that can go wrong while driving the terminal screen.
#[derive(Debug)]
pub enum MonitorError {
    /// Drawing to or reading from the terminal failed
    IOError(std::io::Error),
    /// The worker thread went away before handing back its state
    MPSCRecvError(mpsc::RecvError),
    /// The worker thread panicked
    JoinError,
}

impl Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

impl Error for MonitorError {}

impl From<std::io::Error> for MonitorError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<mpsc::RecvError> for MonitorError {
    fn from(value: mpsc::RecvError) -> Self {
        Self::MPSCRecvError(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_gone_is_a_recv_error() {
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        let err = rx.recv().map_err(MonitorError::from).unwrap_err();
        assert!(matches!(err, MonitorError::MPSCRecvError(_)));
    }

    #[test]
    fn terminal_failures_are_io_errors() {
        let err = MonitorError::from(std::io::Error::new(std::io::ErrorKind::Other, "no tty"));
        assert!(matches!(err, MonitorError::IOError(_)));
        assert!(err.to_string().contains("no tty"));
    }
}
