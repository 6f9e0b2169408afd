use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Upper bound on a single record payload. A length prefix above this is
/// treated as corruption rather than an allocation request.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Record {
    Event(Event),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail: everything from here on is discarded.
    Damaged(&'static str),
}

/// Fill `buf` completely. `Ok(false)` means EOF hit before the first byte
/// or part-way through.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(Record::End);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Damaged("implausible record length"));
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Record::Damaged("truncated payload"));
    }
    if !read_full(reader, &mut word)? {
        return Ok(Record::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Record::Damaged("checksum mismatch"));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Record::Event(event),
        Err(_) => Record::Damaged("undecodable payload"),
    })
}

/// Where the log stood before a batch: its durable length and append count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalMark {
    len: u64,
    appends: u64,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Every fsync fails after the bytes reach the file.
    Sync,
    /// As `Sync`, and truncating back to a mark fails too.
    SyncAndTruncate,
}

/// Append-only event log backing the engine.
///
/// Appends are buffered and made durable by `flush_sync`, so the writer task
/// can fsync once per batch. Compaction is two-phase: the replacement log is
/// written beside the live one, then renamed over it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    #[cfg(test)]
    fault: Option<Fault>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            #[cfg(test)]
            fault: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if self.fault.is_some() {
            return Err(io::Error::other("fsync failed"));
        }
        self.writer.get_ref().sync_all()
    }

    /// Flush and record the current end of the log.
    pub fn mark(&mut self) -> io::Result<WalMark> {
        self.writer.flush()?;
        Ok(WalMark {
            len: self.writer.get_ref().metadata()?.len(),
            appends: self.appends_since_compact,
        })
    }

    /// Cut the log back to `mark`, dropping every record written or buffered since.
    pub fn rollback_to(&mut self, mark: WalMark) -> io::Result<()> {
        #[cfg(test)]
        if self.fault == Some(Fault::SyncAndTruncate) {
            return Err(io::Error::other("truncate failed"));
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // Unflushed bytes belong to the abandoned batch: take them out without writing.
        let (abandoned, _unwritten) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        drop(abandoned);
        let file = self.writer.get_ref();
        file.set_len(mark.len)?;
        file.sync_all()?;
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Phase one: write `events` to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: rename the side file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event. A missing file is an empty log; a damaged
    /// tail is dropped with a warning.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_record(&mut reader)? {
                Record::Event(event) => events.push(event),
                Record::End => break,
                Record::Damaged(reason) => {
                    warn!(path = %path.display(), kept = events.len(), reason, "discarding damaged WAL tail");
                    break;
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, Room, Span};
    use crate::policy::{Setting, SettingValue};
    use std::collections::BTreeSet;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomgate_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn room_created(name: &str) -> Event {
        Event::RoomCreated {
            room: Room {
                id: Ulid::new(),
                name: name.into(),
                capacity: 4,
                floor: 2,
                equipment: BTreeSet::from(["whiteboard".to_string()]),
                description: None,
                active: true,
                constraints: None,
            },
        }
    }

    fn booking_confirmed(room_id: Ulid) -> Event {
        Event::BookingConfirmed {
            booking: Booking {
                id: Ulid::new(),
                room_id,
                requester_id: Ulid::new(),
                date: "2026-10-19".parse().unwrap(),
                span: Span::parse("09:00", "10:00").unwrap(),
                title: Some("standup".into()),
                description: None,
                party_size: 3,
                participants: vec![Ulid::new()],
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            room_created("Salle B"),
            booking_confirmed(Ulid::new()),
            Event::SettingChanged {
                key: "reservations.slot_duration".into(),
                setting: Setting::new("reservations.slot_duration", SettingValue::Integer(15)),
            },
        ];
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
    fn torn_tail_is_discarded() {
        let path = tmp_path("torn_tail.wal");
        let event = room_created("Salle C");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_drops_the_failed_batch() {
        let path = tmp_path("rollback.wal");
        let first = room_created("Salle F");
        let lost = booking_confirmed(Ulid::new());
        let unflushed = booking_confirmed(Ulid::new());
        let after = room_created("Salle G");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            let mark = wal.mark().unwrap();

            // Flushed to the file but never acknowledged.
            wal.inject(Fault::Sync);
            assert!(wal.append(&lost).is_err());
            wal.append_buffered(&unflushed).unwrap();
            wal.rollback_to(mark).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);

            wal.fault = None;
            wal.append(&after).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = room_created("Salle D");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&booking_confirmed(Ulid::new())).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn implausible_length_is_corruption() {
        let path = tmp_path("huge_len.wal");
        fs::write(&path, u32::MAX.to_le_bytes()).unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let room = room_created("Salle E");
        let Event::RoomCreated { room: r } = &room else { unreachable!() };
        let room_id = r.id;
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room).unwrap();
            for _ in 0..20 {
                let Event::BookingConfirmed { booking } = booking_confirmed(room_id) else { unreachable!() };
                wal.append(&Event::BookingConfirmed { booking: booking.clone() }).unwrap();
                wal.append(&Event::BookingCancelled {
                    id: booking.id,
                    room_id,
                    date: booking.date,
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let kept = booking_confirmed(room_id);
        let later = booking_confirmed(room_id);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&[room.clone(), kept.clone()]).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![room, kept, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_count_until_compaction() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| room_created(&format!("Room {i}"))).collect();
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
}
