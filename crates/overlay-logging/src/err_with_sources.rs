use std::error::Error;
use std::fmt;

/// Returns a [`fmt::Display`] adapter that prints the error and every
/// error in its `source()` chain, so a single log line carries the
/// full cause rather than just the outermost message.
pub fn err_with_sources<'a>(e: &'a (dyn Error + 'static)) -> ErrorWithSources<'a> {
    ErrorWithSources { e }
}

pub struct ErrorWithSources<'a> {
    e: &'a (dyn Error + 'static),
}

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.e)?;

        let mut cause = self.e.source();
        while let Some(err) = cause {
            write!(f, ": {err}")?;
            cause = err.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(thiserror::Error, Debug)]
    #[error("oh no!")]
    struct Inner;

    #[derive(thiserror::Error, Debug)]
    #[error("failed to do the thing")]
    struct Middle(#[source] Inner);

    #[derive(thiserror::Error, Debug)]
    #[error("argh")]
    struct Outer(#[source] Middle);

    #[test]
    fn prints_errors_with_sources() {
        let error = Outer(Middle(Inner));

        let display = err_with_sources(&error);

        assert_eq!(display.to_string(), "argh: failed to do the thing: oh no!");
    }
}
