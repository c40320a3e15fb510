use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// A length prefix beyond this is garbage, not a record.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Length prefix plus checksum.
const RECORD_OVERHEAD: u64 = 8;

/// Write one record: `[u32 len][bincode payload][u32 crc32]`, little-endian.
/// Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL record"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(RECORD_OVERHEAD + u64::from(len))
}

/// Fill `buf`, or report `false` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record and its size on disk, or `None` once the log ends or
/// stops checking out.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, RECORD_OVERHEAD + len as u64)))
}

/// Every intact event plus the length of the intact prefix. A missing file
/// is an empty log.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0;
    while let Some((event, size)) = decode_next(&mut reader)? {
        events.push(event);
        intact += size;
    }
    Ok((events, intact))
}

/// Append-only event log backing the engine.
///
/// A crash can leave a torn last record. `recover` cuts the file back to its
/// intact prefix before any new record is appended, so nothing written after
/// a restart ends up behind garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Bytes known to be on disk and intact.
    durable_len: u64,
    /// Bytes handed to the writer since the last `flush_sync`.
    buffered_len: u64,
}

impl Wal {
    /// Replay the log, drop any torn or corrupt tail, and open it for appends.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact) = read_log(path)?;
        let file = Self::open_append(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact {
            warn!(
                path = %path.display(),
                dropped_bytes = on_disk - intact,
                "truncating torn WAL tail"
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len: intact,
            buffered_len: 0,
        };
        Ok((wal, events))
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Append one event and fsync. The writer task batches with `append_buffered` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.buffered_len += encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.buffered_len;
        self.buffered_len = 0;
        Ok(())
    }

    /// Discard everything since the last successful `flush_sync`, both the
    /// buffer and any bytes that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        // `into_parts` hands back the unflushed buffer instead of writing it.
        let (stale, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        drop(stale);
        self.writer.get_ref().set_len(self.durable_len)?;
        self.writer.get_ref().sync_all()?;
        self.buffered_len = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to the side file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = Self::open_append(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.buffered_len = 0;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("parkslot_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn park_saved() -> Event {
        Event::ParkSaved {
            park: ParkProfile {
                id: Ulid::new(),
                name: "Treetop Park".into(),
                schedule: ParkSchedule::with_default_hours("09:00", "18:00"),
            },
        }
    }

    fn reserved(instance_id: Ulid, quantity: u32) -> Event {
        Event::TicketsReserved {
            instance_id,
            quantity,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let events = vec![park_saved(), reserved(Ulid::new(), 3)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = park_saved();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        // A torn second record: partial length prefix plus a couple of bytes.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let good = reserved(Ulid::new(), 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&reserved(Ulid::new(), 2)).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let park = park_saved();
        let instance_id = Ulid::new();
        let after = reserved(instance_id, 4);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&park).unwrap();
            for _ in 0..20 {
                wal.append(&reserved(instance_id, 1)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();

            wal.compact(std::slice::from_ref(&park)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);

            wal.append(&after).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![park, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let instance_id = Ulid::new();
        let events: Vec<Event> = (1..=5).map(|q| reserved(instance_id, q)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_new_appends() {
        let path = tmp_path("torn_then_append.wal");
        let _ = fs::remove_file(&path);

        let first = park_saved();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 5]).unwrap();
        }

        let second = park_saved();
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }

        // A second restart still sees the write made after the first one.
        let (_, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unflushed_and_partial_bytes() {
        let path = tmp_path("rollback.wal");
        let _ = fs::remove_file(&path);

        let kept = reserved(Ulid::new(), 1);
        let later = reserved(Ulid::new(), 3);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&kept).unwrap();

            // Bytes that reached the file without a completed batch.
            wal.append_buffered(&reserved(Ulid::new(), 2)).unwrap();
            wal.writer.flush().unwrap();
            wal.append_buffered(&reserved(Ulid::new(), 9)).unwrap();

            wal.rollback().unwrap();
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }
}
