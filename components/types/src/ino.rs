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

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The "no parent" sentinel; never assigned to a live inode.
pub const ZERO_INO: Ino = Ino(0);
pub const ROOT_INO: Ino = Ino(1);

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ino(pub u64);

impl Ino {
    pub fn is_zero(&self) -> bool { self.0 == 0 }

    pub fn is_root(&self) -> bool { *self == ROOT_INO }

    pub fn next(&self) -> Self { Self(self.0 + 1) }
}

impl Display for Ino {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

impl From<u64> for Ino {
    fn from(value: u64) -> Self { Self(value) }
}

impl From<Ino> for u64 {
    fn from(value: Ino) -> Self { value.0 }
}
