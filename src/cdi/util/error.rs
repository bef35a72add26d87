/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;

/// Boxed error used at process edges (CLI, server bootstrap, background tasks).
pub type DynError = Box<dyn Error + Send + Sync>;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: DynError,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}

/// Wraps `error` so its message is prefixed with `context`.
pub fn with_context<E>(error: E, context: impl Into<String>) -> DynError
where
    E: Into<DynError>,
{
    Box::new(ContextError {
        context: context.into(),
        source: error.into(),
    })
}

pub fn new_error(message: impl Into<String>) -> DynError {
    Box::new(MessageError(message.into()))
}

/// Extension for attaching context while propagating with `?`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, DynError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<DynError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, DynError> {
        self.map_err(|error| with_context(error, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_message_and_keeps_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk gone"));
        let err = result.context("reading tls.crt").unwrap_err();
        assert_eq!(err.to_string(), "reading tls.crt: disk gone");
        assert!(err.source().is_some());
    }
}
