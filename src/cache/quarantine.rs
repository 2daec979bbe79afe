//! The quarantine file: a flat concatenation of 32-byte blob ids
//! known to fail content verification. No framing, no separators:
//! a file whose length isn't a multiple of 32 is corrupt (I3) and is
//! discarded outright rather than partially trusted.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::Error;

pub struct Quarantine {
    path: PathBuf,
}

impl Quarantine {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Append a 32-byte blob id to the quarantine.
    pub fn do_not_use_blob(&self, id: &[u8; 32]) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(id)?;
        file.flush()?;
        Ok(())
    }

    /// Read every quarantined id, as lowercase hex. A file whose
    /// length is not a multiple of 32, or that can't be read at all,
    /// is considered corrupt: it is deleted and whatever was
    /// successfully read before the failure (typically nothing) is
    /// returned.
    pub fn get_quarantine(&self) -> HashSet<String> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashSet::new(),
            Err(_) => return HashSet::new(),
        };

        let mut ids = HashSet::new();
        let mut corrupt = false;

        loop {
            let mut buf = [0u8; 32];
            match read_exact_or_short(&mut file, &mut buf) {
                Ok(0) => break, // clean EOF
                Ok(32) => {
                    ids.insert(hex::encode(buf));
                }
                Ok(_) => {
                    // trailing bytes that don't make up a full id
                    corrupt = true;
                    break;
                }
                Err(_) => {
                    corrupt = true;
                    break;
                }
            }
        }

        if corrupt {
            log::warn!(
                "quarantine file {:?} is corrupt (length not a multiple of 32), deleting it",
                self.path
            );
            let _ = std::fs::remove_file(&self.path);
        }

        ids
    }

    /// Rewrite the quarantine with every id NOT present in `removed`
    /// (the pruner's report of what it actually deleted). A missing
    /// file is a no-op. The rewrite goes through a temp file plus
    /// rename so a crash mid-write can never leave a half-written,
    /// spuriously "corrupt" quarantine behind, a stronger guarantee
    /// than the source's truncate-then-write, still producing the
    /// same end state.
    pub fn on_blobs_removed(&self, removed: &HashSet<String>) -> Result<(), Error> {
        if !self.path.exists() {
            return Ok(());
        }

        let survivors = self.get_quarantine();
        let survivors: Vec<&String> = survivors.iter().filter(|id| !removed.contains(*id)).collect();

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for id in survivors {
                let raw = hex::decode(id)?;
                tmp.write_all(&raw)?;
            }
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// Like `Read::read_exact`, but returns the number of bytes actually
/// read instead of erroring when fewer than `buf.len()` are
/// available before EOF.
fn read_exact_or_short(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
