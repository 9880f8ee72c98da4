//! Defines the Component trait, implemented by each HeadScan processing
//! stage. A component consumes one job at a time on its stage's consumer
//! thread and turns it into an output for the next consumer, see
//! [BoundedStage](crate::pipeline_stage::BoundedStage).

use std::fmt;

/// Things that can go wrong while a component shuts down.
#[derive(Debug)]
pub enum ComponentError {
    /// Finishing a WAV file failed
    HoundError(hound::Error),
    /// Flushing some other output failed
    IoError(std::io::Error),
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::HoundError(error) => write!(f, "hound error: {}", error),
            ComponentError::IoError(error) => write!(f, "io error: {}", error),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<hound::Error> for ComponentError {
    fn from(value: hound::Error) -> Self {
        Self::HoundError(value)
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

///
/// A stage in the HeadScan pipeline, which performs one step of frame
/// preparation or fusion. Every struct that runs on a pipeline consumer
/// thread implements Component, so that it can be driven by a
/// [BoundedStage](crate::pipeline_stage::BoundedStage).
///
pub trait Component: fmt::Display {
    type InData;
    type OutData;

    /// Converts an input job into an output. A job, once started, runs to
    /// completion.
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up at termination of the stage
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Null MockComponent for compilation testing
    struct MockComponent {
        finalized: bool,
    }

    impl Component for MockComponent {
        type InData = i32;
        type OutData = i32;

        fn convert(&mut self, input: i32) -> i32 {
            input + 1
        }

        fn finalize(&mut self) -> Result<(), ComponentError> {
            self.finalized = true;
            Ok(())
        }
    }

    impl fmt::Display for MockComponent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "MockComponent")
        }
    }

    /// Checks that Component can be implemented for custom inner types
    #[test]
    fn test_mock_component() {
        let mut mock_comp = MockComponent { finalized: false };
        assert_eq!(mock_comp.convert(0), 1);
        assert!(mock_comp.finalize().is_ok());
        assert!(mock_comp.finalized);
        assert_eq!(mock_comp.to_string(), "MockComponent");
    }

    #[test]
    fn io_errors_convert() {
        let err: ComponentError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.to_string().contains("disk"));
    }
}
