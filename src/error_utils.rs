// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Display;
use std::panic::Location;

use anyhow::Context;

use crate::prelude::*;

/// Location-carrying context for `anyhow` results.
///
/// `.location()?` tags an error with the call site so that a failure deep in
/// a read or write loop can be traced without a full backtrace. The call site
/// is captured via `#[track_caller]`; no macro argument is needed.
pub trait LocationContextExt<T, E>: Context<T, E> {
    #[track_caller]
    fn location(self) -> Result<T>;

    #[track_caller]
    fn location_ctx<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static;

    #[track_caller]
    fn with_location_ctx<C, F>(self, context: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<R, T, E> LocationContextExt<T, E> for R
where
    R: Context<T, E>,
{
    #[track_caller]
    fn location(self) -> Result<T> {
        let loc = Location::caller();
        Context::with_context(self, || format!("{}:{}", loc.file(), loc.line()))
    }

    #[track_caller]
    fn location_ctx<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        let loc = Location::caller();
        Context::with_context(self, || format!("{}:{}: {}", loc.file(), loc.line(), context))
    }

    #[track_caller]
    fn with_location_ctx<C, F>(self, context: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        let loc = Location::caller();
        Context::with_context(self, || {
            format!("{}:{}: {}", loc.file(), loc.line(), context())
        })
    }
}

/// Log a Result and then return it. Useful in cases such as
/// `foo.try_into().log().ok()`.
pub trait LogExt<T, E>: Context<T, E> {
    #[track_caller]
    fn trace(self) -> Result<T>;
    #[track_caller]
    fn debug(self) -> Result<T>;
    #[track_caller]
    fn info(self) -> Result<T>;
    #[track_caller]
    fn warn(self) -> Result<T>;
    #[track_caller]
    fn error(self) -> Result<T>;
    #[track_caller]
    fn log(self) -> Result<T>;
}

impl<R, T, E> LogExt<T, E> for R
where
    R: Context<T, E>,
{
    #[track_caller]
    fn trace(self) -> Result<T> {
        let res = self.location();
        if let Err(e) = &res {
            trace!("{e:?}");
        }
        res
    }

    #[track_caller]
    fn debug(self) -> Result<T> {
        let res = self.location();
        if let Err(e) = &res {
            debug!("{e:?}");
        }
        res
    }

    #[track_caller]
    fn info(self) -> Result<T> {
        let res = self.location();
        if let Err(e) = &res {
            info!("{e:?}");
        }
        res
    }

    #[track_caller]
    fn warn(self) -> Result<T> {
        let res = self.location();
        if let Err(e) = &res {
            warn!("{e:?}");
        }
        res
    }

    #[track_caller]
    fn error(self) -> Result<T> {
        let res = self.location();
        if let Err(e) = &res {
            error!("{e:?}");
        }
        res
    }

    #[track_caller]
    fn log(self) -> Result<T> {
        self.error()
    }
}

/// Useful when you can't return a Result because you're implementing a
/// foreign trait and don't want to panic.
pub trait LogAndIgnoreExt<T, E>: LogExt<T, E> {
    #[track_caller]
    fn debug_and_ignore(self);
    #[track_caller]
    fn warn_and_ignore(self);
    #[track_caller]
    fn error_and_ignore(self);
    #[track_caller]
    fn log_and_ignore(self);
}

impl<R, T, E> LogAndIgnoreExt<T, E> for R
where
    R: Context<T, E>,
{
    #[track_caller]
    fn debug_and_ignore(self) {
        _ = self.debug();
    }

    #[track_caller]
    fn warn_and_ignore(self) {
        _ = self.warn();
    }

    #[track_caller]
    fn error_and_ignore(self) {
        _ = self.error();
    }

    #[track_caller]
    fn log_and_ignore(self) {
        _ = self.log();
    }
}

/// Like ?, but for functions which return ().
#[macro_export]
macro_rules! log_and_return {
    ($expression:expr) => {
        match $expression {
            Ok(val) => val,
            Err(e) => {
                error!("{e:?}");
                return;
            },
        }
    };
}
pub use log_and_return;

/// Like log_and_return, but continues instead of returns.
#[macro_export]
macro_rules! log_and_continue {
    ($expression:expr) => {
        match $expression {
            Ok(val) => val,
            Err(e) => {
                error!("{e:?}");
                continue;
            },
        }
    };
}
pub use log_and_continue;

#[macro_export]
macro_rules! warn_and_return {
    ($expression:expr) => {
        match $expression {
            Ok(val) => val,
            Err(e) => {
                warn!("{e:?}");
                return;
            },
        }
    };
}
pub use warn_and_return;

#[cfg(test)]
mod tests {
    use super::*;

    fn fails() -> std::result::Result<(), std::io::Error> {
        Err(std::io::Error::other("boom"))
    }

    #[test]
    fn location_appends_call_site() {
        let err = fails().location().unwrap_err();
        let rendered = format!("{err:?}");
        assert!(rendered.contains("error_utils.rs"));
        assert!(rendered.contains("boom"));
    }

    #[test]
    fn location_ctx_appends_message() {
        let err = fails().location_ctx("reading preamble").unwrap_err();
        assert!(format!("{err:?}").contains("reading preamble"));
    }
}
