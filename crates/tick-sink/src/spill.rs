//! 스필 세그먼트 로그.
//!
//! 원격 저장소에 쓰지 못한 배치를 디스크에 보관합니다.
//!
//! # 레이아웃
//!
//! ```text
//! <dir>/segment-<first_seq>-<last_seq>.log   [u32 LE 길이][JSON 행 배열] 레코드의 연속
//! <dir>/MANIFEST                             세그먼트 목록 (JSON, first_seq 순)
//! ```
//!
//! 세그먼트와 MANIFEST 모두 임시 파일에 쓰고 fsync 한 뒤 rename 합니다.
//! 총 바이트가 상한을 넘으면 `first_seq`가 가장 작은 세그먼트부터 삭제합니다.
//!
//! 모든 메서드는 블로킹 I/O입니다. 비동기 컨텍스트에서는 `spawn_blocking`으로 호출합니다.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{SinkError, SinkResult};
use crate::row::{seq_range, TickRow};

/// MANIFEST 파일 이름.
pub const MANIFEST_FILE: &str = "MANIFEST";

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";
const TMP_SUFFIX: &str = ".tmp";
const RECORD_HEADER: usize = 4;
const MANIFEST_VERSION: u32 = 1;

/// 세그먼트 메타데이터.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// 디렉터리 내 파일 이름
    pub file_name: String,
    pub first_seq: i64,
    pub last_seq: i64,
    /// 생성 시각 (유닉스 ns)
    pub created_ns: u64,
    pub byte_size: u64,
    /// 행 수
    pub rows: u64,
    /// 이전 실행에서 남은 세그먼트 여부 (저장하지 않음)
    #[serde(skip)]
    pub inherited: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    segments: Vec<SegmentMeta>,
}

/// 추가 결과.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// 새로 쓴 바이트
    pub bytes: u64,
    /// 새로 만든 세그먼트 수
    pub segments: usize,
    /// 상한 초과로 삭제된 세그먼트
    pub evicted: Vec<SegmentMeta>,
}

impl AppendOutcome {
    /// 삭제된 행 수 (이번 실행에서 만든 세그먼트만).
    pub fn evicted_own_rows(&self) -> u64 {
        self.evicted
            .iter()
            .filter(|m| !m.inherited)
            .map(|m| m.rows)
            .sum()
    }
}

/// 상한이 있는 세그먼트 로그.
#[derive(Debug)]
pub struct SegmentLog {
    dir: PathBuf,
    cap_bytes: u64,
    segment_max_bytes: u64,
    manifest: Manifest,
}

impl SegmentLog {
    /// 디렉터리를 열고 MANIFEST를 복구합니다.
    ///
    /// 남은 임시 파일은 삭제합니다. MANIFEST가 없거나 손상되었으면 세그먼트 파일을
    /// 스캔해 다시 만들고, 파일이 없는 항목은 버리고 목록에 없는 파일은 추가합니다.
    pub fn open(dir: impl Into<PathBuf>, cap_bytes: u64, segment_max_bytes: u64) -> SinkResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut files = HashSet::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                debug!(file = %name, "남은 임시 파일 삭제");
                fs::remove_file(entry.path())?;
            } else if parse_segment_name(&name).is_some() {
                files.insert(name);
            }
        }

        let loaded = match fs::read(dir.join(MANIFEST_FILE)) {
            Ok(bytes) => match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "MANIFEST 손상, 세그먼트 스캔으로 복구");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let rebuilt = loaded.is_none();

        let mut segments: Vec<SegmentMeta> = loaded
            .map(|m| m.segments)
            .unwrap_or_default()
            .into_iter()
            .filter(|meta| files.remove(&meta.file_name))
            .collect();

        // MANIFEST에 없는 세그먼트 파일
        for name in files {
            match scan_segment(&dir, &name) {
                Ok(meta) => segments.push(meta),
                Err(e) => {
                    warn!(file = %name, error = %e, "읽을 수 없는 세그먼트 삭제");
                    fs::remove_file(dir.join(&name))?;
                }
            }
        }

        for meta in &mut segments {
            meta.inherited = true;
        }
        segments.sort_by_key(|m| (m.first_seq, m.last_seq));

        let mut log = Self {
            dir,
            cap_bytes,
            segment_max_bytes: segment_max_bytes.max(1),
            manifest: Manifest {
                version: MANIFEST_VERSION,
                segments,
            },
        };
        log.persist_manifest()?;

        if !log.is_empty() {
            info!(
                dir = %log.dir.display(),
                segments = log.manifest.segments.len(),
                bytes = log.total_bytes(),
                rebuilt = rebuilt,
                "기존 스필 세그먼트 로드"
            );
        }
        Ok(log)
    }

    /// 디렉터리 경로.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 세그먼트 목록 (`first_seq` 순).
    pub fn segments(&self) -> &[SegmentMeta] {
        &self.manifest.segments
    }

    /// 가장 오래된 세그먼트.
    pub fn oldest(&self) -> Option<&SegmentMeta> {
        self.manifest.segments.first()
    }

    /// 세그먼트 총 바이트.
    pub fn total_bytes(&self) -> u64 {
        self.manifest.segments.iter().map(|m| m.byte_size).sum()
    }

    /// 세그먼트 총 행 수.
    pub fn total_rows(&self) -> u64 {
        self.manifest.segments.iter().map(|m| m.rows).sum()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.manifest.segments.is_empty()
    }

    /// 배치를 새 세그먼트로 추가합니다.
    ///
    /// 세그먼트 최대 크기를 넘으면 여러 세그먼트로 나눕니다. 추가 후 총 바이트가
    /// 상한을 넘으면 오래된 세그먼트부터 삭제합니다.
    pub fn append(&mut self, rows: &[TickRow]) -> SinkResult<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        if rows.is_empty() {
            return Ok(outcome);
        }

        for chunk in self.encode_chunks(rows)? {
            let meta = self.write_segment(&chunk.rows, &chunk.record)?;
            outcome.bytes += meta.byte_size;
            outcome.segments += 1;
            self.insert_meta(meta);
        }

        while self.total_bytes() > self.cap_bytes && !self.is_empty() {
            let oldest = self.manifest.segments.remove(0);
            remove_if_exists(&self.dir.join(&oldest.file_name))?;
            warn!(
                file = %oldest.file_name,
                rows = oldest.rows,
                bytes = oldest.byte_size,
                cap = self.cap_bytes,
                "스필 상한 초과, 가장 오래된 세그먼트 삭제"
            );
            outcome.evicted.push(oldest);
        }

        self.persist_manifest()?;
        Ok(outcome)
    }

    /// 세그먼트의 행을 읽습니다.
    pub fn read(&self, meta: &SegmentMeta) -> SinkResult<Vec<TickRow>> {
        read_segment(&self.dir.join(&meta.file_name))
    }

    /// 세그먼트를 삭제합니다.
    pub fn remove(&mut self, meta: &SegmentMeta) -> SinkResult<()> {
        remove_if_exists(&self.dir.join(&meta.file_name))?;
        self.manifest
            .segments
            .retain(|m| m.file_name != meta.file_name);
        self.persist_manifest()
    }

    /// MANIFEST를 다시 기록하고 디렉터리를 동기화합니다.
    pub fn sync(&mut self) -> SinkResult<()> {
        self.persist_manifest()
    }

    fn insert_meta(&mut self, meta: SegmentMeta) {
        let pos = self
            .manifest
            .segments
            .partition_point(|m| (m.first_seq, m.last_seq) <= (meta.first_seq, meta.last_seq));
        self.manifest.segments.insert(pos, meta);
    }

    /// 행을 세그먼트 크기 이하의 레코드로 나눕니다.
    fn encode_chunks(&self, rows: &[TickRow]) -> SinkResult<Vec<EncodedChunk>> {
        let limit = self.segment_max_bytes as usize;
        let mut chunks = Vec::new();
        let mut current = EncodedChunk::default();

        for row in rows {
            let encoded = serde_json::to_vec(row)?;
            // 헤더 + '[' + ']' + ','
            let projected = RECORD_HEADER + current.record.len() + encoded.len() + 3;
            if !current.rows.is_empty() && projected > limit {
                chunks.push(std::mem::take(&mut current));
            }
            current.record.push(if current.rows.is_empty() { b'[' } else { b',' });
            current.record.extend_from_slice(&encoded);
            current.rows.push(row.clone());
        }
        if !current.rows.is_empty() {
            chunks.push(current);
        }

        for chunk in &mut chunks {
            chunk.record.push(b']');
        }
        Ok(chunks)
    }

    fn write_segment(&self, rows: &[TickRow], record: &[u8]) -> SinkResult<SegmentMeta> {
        let (first_seq, last_seq) = seq_range(rows)
            .ok_or_else(|| SinkError::Spill("빈 세그먼트".to_string()))?;
        let file_name = self.unique_name(first_seq, last_seq);

        let len = u32::try_from(record.len())
            .map_err(|_| SinkError::Spill(format!("레코드가 너무 큼: {} 바이트", record.len())))?;
        let mut bytes = Vec::with_capacity(RECORD_HEADER + record.len());
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(record);

        write_atomic(&self.dir, &file_name, &bytes)?;

        Ok(SegmentMeta {
            file_name,
            first_seq,
            last_seq,
            created_ns: now_unix_ns(),
            byte_size: bytes.len() as u64,
            rows: rows.len() as u64,
            inherited: false,
        })
    }

    fn unique_name(&self, first_seq: i64, last_seq: i64) -> String {
        let base = format!("{}{}-{}", SEGMENT_PREFIX, first_seq, last_seq);
        let candidate = format!("{}{}", base, SEGMENT_SUFFIX);
        if !self.dir.join(&candidate).exists() {
            return candidate;
        }
        (1u32..)
            .map(|n| format!("{}.{}{}", base, n, SEGMENT_SUFFIX))
            .find(|name| !self.dir.join(name).exists())
            .unwrap_or(candidate)
    }

    fn persist_manifest(&mut self) -> SinkResult<()> {
        self.manifest.version = MANIFEST_VERSION;
        let bytes = serde_json::to_vec_pretty(&self.manifest)?;
        write_atomic(&self.dir, MANIFEST_FILE, &bytes)
    }
}

#[derive(Debug, Default)]
struct EncodedChunk {
    rows: Vec<TickRow>,
    record: Vec<u8>,
}

/// `segment-<first>-<last>[.n].log` 이름에서 시퀀스 범위를 추출합니다.
pub fn parse_segment_name(name: &str) -> Option<(i64, i64)> {
    let body = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    let body = body.split('.').next()?;
    // 시퀀스는 음수가 아님
    let (first, last) = body.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}

/// 세그먼트 파일을 디코딩합니다.
pub fn read_segment(path: &Path) -> SinkResult<Vec<TickRow>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut rows = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let header = bytes
            .get(offset..offset + RECORD_HEADER)
            .ok_or_else(|| SinkError::Spill(format!("잘린 레코드 헤더: {}", path.display())))?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        offset += RECORD_HEADER;

        let body = bytes
            .get(offset..offset + len)
            .ok_or_else(|| SinkError::Spill(format!("잘린 레코드: {}", path.display())))?;
        let batch: Vec<TickRow> = serde_json::from_slice(body)?;
        rows.extend(batch);
        offset += len;
    }
    Ok(rows)
}

fn scan_segment(dir: &Path, name: &str) -> SinkResult<SegmentMeta> {
    let path = dir.join(name);
    let rows = read_segment(&path)?;
    let (first_seq, last_seq) = seq_range(&rows)
        .or_else(|| parse_segment_name(name))
        .ok_or_else(|| SinkError::Spill(format!("세그먼트 이름 오류: {}", name)))?;
    Ok(SegmentMeta {
        file_name: name.to_string(),
        first_seq,
        last_seq,
        created_ns: now_unix_ns(),
        byte_size: fs::metadata(&path)?.len(),
        rows: rows.len() as u64,
        inherited: true,
    })
}

/// 임시 파일에 쓰고 fsync 한 뒤 rename 합니다.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> SinkResult<()> {
    let tmp = dir.join(format!("{}{}", name, TMP_SUFFIX));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(name))?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn remove_if_exists(path: &Path) -> SinkResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn now_unix_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::fixtures::{sample_row, sample_rows};
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
        let rows = sample_rows(10, 100);

        let outcome = log.append(&rows).unwrap();
        assert_eq!(outcome.segments, 1);
        assert!(outcome.evicted.is_empty());

        let oldest = log.oldest().unwrap().clone();
        assert_eq!(oldest.file_name, "segment-100-109.log");
        assert_eq!((oldest.first_seq, oldest.last_seq, oldest.rows), (100, 109, 10));
        assert_eq!(oldest.byte_size, outcome.bytes);
        assert_eq!(log.read(&oldest).unwrap(), rows);
        assert!(dir.path().join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_segments_ordered_by_first_seq() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();

        log.append(&sample_rows(3, 50)).unwrap();
        log.append(&sample_rows(3, 10)).unwrap();
        log.append(&sample_rows(3, 30)).unwrap();

        let firsts: Vec<i64> = log.segments().iter().map(|m| m.first_seq).collect();
        assert_eq!(firsts, vec![10, 30, 50]);
    }

    #[test]
    fn test_large_batch_split_into_segments() {
        let dir = TempDir::new().unwrap();
        let one_row = serde_json::to_vec(&sample_row("SH600000", 1)).unwrap().len() as u64;
        let mut log = SegmentLog::open(dir.path(), MIB, one_row * 3).unwrap();

        let rows = sample_rows(10, 1);
        let outcome = log.append(&rows).unwrap();

        assert!(outcome.segments >= 4);
        assert!(log.segments().iter().all(|m| m.byte_size <= one_row * 3));
        let restored: Vec<TickRow> = log
            .segments()
            .iter()
            .flat_map(|m| log.read(m).unwrap())
            .collect();
        assert_eq!(restored, rows);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
        let first = log.append(&sample_rows(5, 1)).unwrap();
        let cap = first.bytes * 2 + first.bytes / 2;
        drop(log);

        let mut log = SegmentLog::open(dir.path(), cap, MIB).unwrap();
        log.append(&sample_rows(5, 6)).unwrap();
        let outcome = log.append(&sample_rows(5, 11)).unwrap();

        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].first_seq, 1);
        assert!(outcome.evicted[0].inherited);
        assert_eq!(outcome.evicted_own_rows(), 0);
        assert!(log.total_bytes() <= cap);
        assert!(!dir.path().join("segment-1-5.log").exists());
        assert_eq!(log.oldest().unwrap().first_seq, 6);
    }

    #[test]
    fn test_remove_segment() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
        log.append(&sample_rows(2, 1)).unwrap();
        log.append(&sample_rows(2, 3)).unwrap();

        let oldest = log.oldest().unwrap().clone();
        log.remove(&oldest).unwrap();

        assert_eq!(log.segments().len(), 1);
        assert!(!dir.path().join(&oldest.file_name).exists());
        assert_eq!(log.total_rows(), 2);
    }

    #[test]
    fn test_reopen_restores_manifest() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
            log.append(&sample_rows(4, 1)).unwrap();
            log.append(&sample_rows(4, 5)).unwrap();
        }

        let log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
        assert_eq!(log.segments().len(), 2);
        assert!(log.segments().iter().all(|m| m.inherited));
        assert_eq!(log.total_rows(), 8);
    }

    #[test]
    fn test_rebuild_without_manifest_and_clean_tmp() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
            log.append(&sample_rows(3, 7)).unwrap();
        }
        fs::remove_file(dir.path().join(MANIFEST_FILE)).unwrap();
        fs::write(dir.path().join("segment-20-21.log.tmp"), b"partial").unwrap();

        let log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
        assert_eq!(log.segments().len(), 1);
        let meta = &log.segments()[0];
        assert_eq!((meta.first_seq, meta.last_seq, meta.rows), (7, 9, 3));
        assert!(!dir.path().join("segment-20-21.log.tmp").exists());
    }

    #[test]
    fn test_manifest_entry_without_file_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
            log.append(&sample_rows(2, 1)).unwrap();
            log.append(&sample_rows(2, 3)).unwrap();
        }
        fs::remove_file(dir.path().join("segment-1-2.log")).unwrap();

        let log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
        assert_eq!(log.segments().len(), 1);
        assert_eq!(log.oldest().unwrap().first_seq, 3);
    }

    #[test]
    fn test_truncated_segment_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment-1-1.log");
        fs::write(&path, [200u8, 0, 0, 0, b'[']).unwrap();
        assert!(matches!(read_segment(&path), Err(SinkError::Spill(_))));
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("segment-10-20.log"), Some((10, 20)));
        assert_eq!(parse_segment_name("segment-10-20.1.log"), Some((10, 20)));
        assert_eq!(parse_segment_name("MANIFEST"), None);
        assert_eq!(parse_segment_name("segment-x-20.log"), None);
    }

    #[test]
    fn test_duplicate_range_gets_unique_name() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentLog::open(dir.path(), MIB, MIB).unwrap();
        log.append(&sample_rows(2, 1)).unwrap();
        log.append(&sample_rows(2, 1)).unwrap();

        assert_eq!(log.segments().len(), 2);
        assert!(dir.path().join("segment-1-2.1.log").exists());
    }
}
