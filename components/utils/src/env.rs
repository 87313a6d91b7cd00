// Copyright 2024 mftfs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use mftfs_common::{MFTFS, MFTFS_HOME_ENV};
use snafu::{whatever, Whatever};

/// Reads an environment variable for the current process.
///
/// Compared to [std::env::var] there are a couple of differences:
///
/// - [var] uses [dotenvy] which loads the `.env` file from the current or
///   parent directories before returning the value.
///
/// - [var] returns `Ok(None)` (instead of `Err`) if an environment variable
///   wasn't set.
#[track_caller]
pub fn var(key: &str) -> Result<Option<String>, Whatever> {
    match dotenvy::var(key) {
        Ok(content) => Ok(Some(content)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(error) => whatever!(Err(error), "Failed to read {key} environment variable"),
    }
}

/// Directory holding the mount registry: `$MFTFS_HOME`, else `~/.mftfs`.
pub fn home_dir() -> Result<PathBuf, Whatever> {
    if let Some(dir) = var(MFTFS_HOME_ENV)? {
        return Ok(PathBuf::from(dir));
    }
    match var("HOME")? {
        Some(home) => Ok(PathBuf::from(home).join(format!(".{MFTFS}"))),
        None => whatever!("neither {MFTFS_HOME_ENV} nor HOME is set"),
    }
}
