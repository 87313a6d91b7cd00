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

pub mod ino;
pub mod record;
pub mod setattr;
pub mod stamp;

pub trait ToErrno {
    fn to_errno(&self) -> libc::c_int;
}

impl ToErrno for std::io::Error {
    fn to_errno(&self) -> libc::c_int { self.raw_os_error().unwrap_or(libc::EIO) }
}
