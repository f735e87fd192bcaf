use crate::bins::SliceExt;
use crate::id::{Lsn, LsnExt, PageId, TxId, TxIdExt};
use anyhow::anyhow;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: &[u8] = b"db_wal";
const WAL_VERSION: u16 = 0;
const WAL_HEADER_SIZE: usize = 32;

// lsn (8), prev_lsn (8), txid (8), kind (1), reserved (3), payload size (4)
const RECORD_HEADER_SIZE: usize = 32;
const RECORD_CHECKSUM_SIZE: usize = 8;

const WAL_RECORD_BEGIN_KIND: u8 = 1;
const WAL_RECORD_COMMIT_KIND: u8 = 2;
const WAL_RECORD_ABORT_KIND: u8 = 3;
const WAL_RECORD_UPDATE_KIND: u8 = 10;

/// Append-only log of one table. The lsn of a record is its byte offset in the log file.
pub(crate) struct Wal {
    f: File,
    buffer: Vec<u8>,
    offset_end: usize,
    next_lsn: Lsn,
    next_txid: TxId,
}

impl Wal {
    pub(crate) fn path_for(table_path: &Path) -> PathBuf {
        let mut name = table_path.as_os_str().to_owned();
        name.push(".wal");
        PathBuf::from(name)
    }

    pub(crate) fn open(path: &Path, buffer_size: usize) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if !f.metadata()?.is_file() {
            return Err(anyhow!("wal file is not a regular file"));
        }

        if f.metadata()?.len() < WAL_HEADER_SIZE as u64 {
            let header = WalHeader {
                version: WAL_VERSION,
            };
            let mut header_buff = [0u8; WAL_HEADER_SIZE];
            header.encode(&mut header_buff);
            f.set_len(0)?;
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&header_buff)?;
            f.sync_all()?;
        } else {
            let mut header_buff = [0u8; WAL_HEADER_SIZE];
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut header_buff)?;
            if header_buff[0..6].cmp(WAL_MAGIC).is_ne() {
                return Err(anyhow!("the file is not a wal file"));
            }
            let header =
                WalHeader::decode(&header_buff).ok_or_else(|| anyhow!("corrupted wal file"))?;
            if header.version != WAL_VERSION {
                return Err(anyhow!("unsupported WAL version: {}", header.version));
            }
        }

        let mut wal = Self {
            f,
            buffer: vec![0u8; buffer_size],
            offset_end: 0,
            next_lsn: Lsn::new(WAL_HEADER_SIZE as u64),
            next_txid: TxId::new(1).unwrap(),
        };
        wal.analyze()?;
        Ok(wal)
    }

    fn analyze(&mut self) -> anyhow::Result<()> {
        let mut lsn = Lsn::new(WAL_HEADER_SIZE as u64);
        let mut buff = Vec::new();
        let mut max_txid = None;
        let mut unfinished = None;
        while let Some(entry) = self.read_at(lsn, &mut buff)? {
            max_txid = max_txid.max(Some(entry.txid));
            match entry.record {
                WalRecord::Begin => unfinished = Some(entry.txid),
                WalRecord::Commit | WalRecord::Abort => unfinished = None,
                WalRecord::Update { .. } => (),
            }
            lsn.add_assign(entry.size() as u64);
        }

        let file_size = self.f.metadata()?.len();
        if lsn.get() < file_size {
            log::warn!(
                "discarding {} bytes of incomplete records at the end of the wal",
                file_size - lsn.get()
            );
            self.f.set_len(lsn.get())?;
            self.f.sync_all()?;
        }
        if let Some(txid) = unfinished {
            log::warn!("transaction {txid:?} was never finished, its changes are not reverted");
        }

        self.next_lsn = lsn;
        if let Some(txid) = max_txid {
            self.next_txid = txid.next();
        }
        Ok(())
    }

    pub(crate) fn next_txid(&mut self) -> TxId {
        let txid = self.next_txid;
        self.next_txid = txid.next();
        txid
    }

    pub(crate) fn append(
        &mut self,
        txid: TxId,
        prev_lsn: Option<Lsn>,
        record: WalRecord,
    ) -> anyhow::Result<Lsn> {
        let lsn = self.next_lsn;
        let entry = WalEntry {
            lsn,
            prev_lsn,
            txid,
            record,
        };
        let size = entry.size();

        if self.offset_end + size > self.buffer.len() {
            self.flush()?;
        }
        if size > self.buffer.len() {
            let mut buff = vec![0u8; size];
            entry.encode(&mut buff);
            self.f.seek(SeekFrom::End(0))?;
            self.f.write_all(&buff)?;
        } else {
            let offset_end = self.offset_end;
            entry.encode(&mut self.buffer[offset_end..offset_end + size]);
            self.offset_end += size;
        }

        self.next_lsn.add_assign(size as u64);
        Ok(lsn)
    }

    pub(crate) fn flush(&mut self) -> anyhow::Result<()> {
        if self.offset_end == 0 {
            return Ok(());
        }
        self.f.seek(SeekFrom::End(0))?;
        self.f.write_all(&self.buffer[..self.offset_end])?;
        self.offset_end = 0;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> anyhow::Result<()> {
        self.flush()?;
        self.f.sync_all()?;
        Ok(())
    }

    /// Reads the record starting at `lsn` into `buff`. Only flushed records are visible.
    /// Returns `None` when there is no complete, valid record at that position.
    pub(crate) fn read_at<'a>(
        &mut self,
        lsn: Lsn,
        buff: &'a mut Vec<u8>,
    ) -> anyhow::Result<Option<WalEntry<'a>>> {
        let file_size = self.f.metadata()?.len();
        if lsn.get() + (RECORD_HEADER_SIZE + RECORD_CHECKSUM_SIZE) as u64 > file_size {
            return Ok(None);
        }

        buff.resize(RECORD_HEADER_SIZE, 0);
        self.f.seek(SeekFrom::Start(lsn.get()))?;
        self.f.read_exact(&mut buff[..RECORD_HEADER_SIZE])?;
        let payload_size = buff[28..32].read_u32() as usize;
        let size = RECORD_HEADER_SIZE + payload_size + RECORD_CHECKSUM_SIZE;
        if lsn.get() + size as u64 > file_size {
            return Ok(None);
        }
        buff.resize(size, 0);
        self.f.read_exact(&mut buff[RECORD_HEADER_SIZE..])?;

        match WalEntry::decode(buff) {
            Some(entry) if entry.lsn == lsn => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    pub(crate) fn close(mut self) -> anyhow::Result<()> {
        self.sync()
    }
}

struct WalHeader {
    version: u16,
}

impl WalHeader {
    fn decode(buff: &[u8]) -> Option<Self> {
        let version = buff[6..8].read_u16();
        let stored_checksum = buff[24..32].read_u64();
        let calculated_checksum = crc64::crc64(0, &buff[0..24]);
        if stored_checksum != calculated_checksum {
            return None;
        }
        Some(WalHeader { version })
    }

    fn encode(&self, buff: &mut [u8]) {
        buff[0..6].copy_from_slice(WAL_MAGIC);
        buff[6..8].copy_from_slice(&self.version.to_be_bytes());
        buff[8..24].fill(0);
        let checksum = crc64::crc64(0, &buff[0..24]);
        buff[24..32].copy_from_slice(&checksum.to_be_bytes());
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WalRecord<'a> {
    Begin,
    Commit,
    Abort,
    /// Bytes `[offset, offset + before.len())` of the page changed from `before` to `after`.
    Update {
        pgid: PageId,
        offset: u16,
        before: &'a [u8],
        after: &'a [u8],
    },
}

impl<'a> WalRecord<'a> {
    fn kind(&self) -> u8 {
        match self {
            WalRecord::Begin => WAL_RECORD_BEGIN_KIND,
            WalRecord::Commit => WAL_RECORD_COMMIT_KIND,
            WalRecord::Abort => WAL_RECORD_ABORT_KIND,
            WalRecord::Update { .. } => WAL_RECORD_UPDATE_KIND,
        }
    }

    fn size(&self) -> usize {
        match self {
            WalRecord::Begin | WalRecord::Commit | WalRecord::Abort => 0,
            WalRecord::Update { before, after, .. } => 8 + 2 + 2 + before.len() + after.len(),
        }
    }

    fn encode(&self, buff: &mut [u8]) {
        match self {
            WalRecord::Begin | WalRecord::Commit | WalRecord::Abort => (),
            WalRecord::Update {
                pgid,
                offset,
                before,
                after,
            } => {
                assert_eq!(before.len(), after.len());
                let len = before.len();
                buff[0..8].copy_from_slice(&pgid.get().to_be_bytes());
                buff[8..10].copy_from_slice(&offset.to_be_bytes());
                buff[10..12].copy_from_slice(&(len as u16).to_be_bytes());
                buff[12..12 + len].copy_from_slice(before);
                buff[12 + len..12 + 2 * len].copy_from_slice(after);
            }
        }
    }

    fn decode(buff: &'a [u8], kind: u8) -> Option<Self> {
        match kind {
            WAL_RECORD_BEGIN_KIND => Some(WalRecord::Begin),
            WAL_RECORD_COMMIT_KIND => Some(WalRecord::Commit),
            WAL_RECORD_ABORT_KIND => Some(WalRecord::Abort),
            WAL_RECORD_UPDATE_KIND => {
                if buff.len() < 12 {
                    return None;
                }
                let pgid = PageId::from_be_bytes(buff[0..8].try_into().unwrap());
                let offset = buff[8..10].read_u16();
                let len = buff[10..12].read_u16() as usize;
                if buff.len() != 12 + 2 * len {
                    return None;
                }
                Some(WalRecord::Update {
                    pgid,
                    offset,
                    before: &buff[12..12 + len],
                    after: &buff[12 + len..12 + 2 * len],
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WalEntry<'a> {
    pub(crate) lsn: Lsn,
    pub(crate) prev_lsn: Option<Lsn>,
    pub(crate) txid: TxId,
    pub(crate) record: WalRecord<'a>,
}

impl<'a> WalEntry<'a> {
    pub(crate) fn size(&self) -> usize {
        RECORD_HEADER_SIZE + self.record.size() + RECORD_CHECKSUM_SIZE
    }

    fn encode(&self, buff: &mut [u8]) {
        let payload_size = self.record.size();
        assert_eq!(self.size(), buff.len());

        buff[0..8].copy_from_slice(&self.lsn.to_be_bytes());
        buff[8..16].copy_from_slice(&self.prev_lsn.to_be_bytes());
        buff[16..24].copy_from_slice(&self.txid.to_be_bytes());
        buff[24] = self.record.kind();
        buff[25..28].fill(0);
        buff[28..32].copy_from_slice(&(payload_size as u32).to_be_bytes());
        self.record
            .encode(&mut buff[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_size]);

        let next = RECORD_HEADER_SIZE + payload_size;
        let checksum = crc64::crc64(0, &buff[0..next]);
        buff[next..next + 8].copy_from_slice(&checksum.to_be_bytes());
    }

    fn decode(buff: &'a [u8]) -> Option<Self> {
        if buff.len() < RECORD_HEADER_SIZE + RECORD_CHECKSUM_SIZE {
            return None;
        }
        let payload_size = buff[28..32].read_u32() as usize;
        let next = RECORD_HEADER_SIZE + payload_size;
        if buff.len() != next + RECORD_CHECKSUM_SIZE {
            return None;
        }

        let calculated_checksum = crc64::crc64(0, &buff[0..next]);
        let stored_checksum = buff[next..].read_u64();
        if calculated_checksum != stored_checksum {
            return None;
        }

        let lsn = Lsn::from_be_bytes(buff[0..8].try_into().unwrap())?;
        let prev_lsn = Lsn::from_be_bytes(buff[8..16].try_into().unwrap());
        let txid = TxId::from_be_bytes(buff[16..24].try_into().unwrap())?;
        let record = WalRecord::decode(&buff[RECORD_HEADER_SIZE..next], buff[24])?;
        Some(WalEntry {
            lsn,
            prev_lsn,
            txid,
            record,
        })
    }
}
