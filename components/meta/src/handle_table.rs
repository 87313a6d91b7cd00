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

use std::collections::HashMap;

use mftfs_common::FH;
use mftfs_types::ino::Ino;
use rand::RngCore;
use tracing::debug;

/// Maps open handles to the inode they were minted for.
///
/// Handles are random non-zero 64-bit values; a candidate already in use is
/// thrown away and drawn again.
#[derive(Debug, Default)]
pub struct HandleTable {
    handles: HashMap<FH, Ino>,
}

impl HandleTable {
    pub fn new() -> Self { Self::default() }

    pub fn mint(&mut self, ino: Ino) -> FH { self.mint_with(ino, &mut rand::thread_rng()) }

    pub fn mint_with<R: RngCore + ?Sized>(&mut self, ino: Ino, rng: &mut R) -> FH {
        loop {
            let fh = rng.next_u64();
            if fh == 0 || self.handles.contains_key(&fh) {
                debug!("handle {fh} collided, drawing again");
                continue;
            }
            self.handles.insert(fh, ino);
            return fh;
        }
    }

    pub fn resolve(&self, fh: FH) -> Option<Ino> { self.handles.get(&fh).copied() }

    pub fn release(&mut self, fh: FH) -> Option<Ino> { self.handles.remove(&fh) }

    /// Drops every handle bound to `ino`.
    pub fn release_inode(&mut self, ino: Ino) { self.handles.retain(|_, v| *v != ino); }

    pub fn len(&self) -> usize { self.handles.len() }

    pub fn is_empty(&self) -> bool { self.handles.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Replays a fixed sequence of values.
    struct Scripted(std::vec::IntoIter<u64>);

    impl RngCore for Scripted {
        fn next_u32(&mut self) -> u32 { self.next_u64() as u32 }

        fn next_u64(&mut self) -> u64 { self.0.next().expect("script exhausted") }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = self.next_u64() as u8;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn collision_is_redrawn() {
        let mut table = HandleTable::new();
        let mut rng = Scripted(vec![7, 0, 7, 7, 9].into_iter());
        assert_eq!(table.mint_with(Ino(2), &mut rng), 7);
        // 0 is reserved and 7 is taken.
        assert_eq!(table.mint_with(Ino(3), &mut rng), 9);
        assert_eq!(table.resolve(7), Some(Ino(2)));
        assert_eq!(table.resolve(9), Some(Ino(3)));
    }

    #[test]
    fn released_handles_stop_resolving() {
        let mut table = HandleTable::new();
        let a = table.mint(Ino(2));
        let b = table.mint(Ino(2));
        let c = table.mint(Ino(3));
        assert_eq!(table.release(a), Some(Ino(2)));
        assert_eq!(table.resolve(a), None);
        table.release_inode(Ino(2));
        assert_eq!(table.resolve(b), None);
        assert_eq!(table.resolve(c), Some(Ino(3)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn live_handles_are_distinct() {
        let mut table = HandleTable::new();
        let minted: HashSet<_> = (0..1000).map(|i| table.mint(Ino(i))).collect();
        assert_eq!(minted.len(), 1000);
    }
}
