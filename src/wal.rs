use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Encode one commit as `[len][bincode][crc32]`.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log of commits.
///
/// Format per entry: `[u32: len][bincode: Commit][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
    /// Commits buffered since the last successful `flush_sync`.
    unsynced: u64,
    #[cfg(test)]
    fail_after: Option<u64>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            unsynced: 0,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Append one commit and fsync. Production code batches with
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer one commit without flushing. `flush_sync()` makes the batch durable.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        #[cfg(test)]
        if let Some(left) = self.fail_after {
            if left == 0 {
                self.fail_after = None;
                return Err(io::Error::other("injected append failure"));
            }
            self.fail_after = Some(left - 1);
        }
        self.unsynced += 1;
        self.appends_since_compact += 1;
        encode_commit(&mut self.writer, commit)
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.durable_len = file.metadata()?.len();
        self.unsynced = 0;
        Ok(())
    }

    /// Discard everything appended since the last successful `flush_sync`
    /// and truncate the file back to that length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (stale_file, _unwritten) = stale.into_parts();
        drop(stale_file);

        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.unsynced);
        self.unsynced = 0;
        Ok(())
    }

    /// Make the next `n` appends succeed and the one after fail.
    #[cfg(test)]
    pub fn fail_appends_after(&mut self, n: u64) {
        self.fail_after = Some(n);
    }

    /// Return the WAL file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted commits to a temp file and fsync.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning every intact commit in order.
    /// A truncated or corrupt tail is discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();

        loop {
            // Read length prefix
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            // Read payload
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            // Read CRC
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            let computed_crc = crc32fast::hash(&payload);

            if stored_crc != computed_crc {
                // Corrupt entry, stop replaying
                break;
            }

            match bincode::deserialize::<Commit>(&payload) {
                Ok(commit) => commits.push(commit),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(commits)
    }
}
