//! Streaming tar+gzip layer encoder.
//!
//! Walks a list of rootfs directories on a blocking thread and writes one
//! continuous archive, cut into segments whenever the projected compressed
//! size of the current segment would exceed the layer budget. Each segment
//! is a complete tar+gzip stream of its own and is handed to the consumer
//! through a single-slot channel as soon as it is opened, so blob commit
//! runs concurrently with the walk.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rootmerge_core::config::SplitPolicy;
use rootmerge_core::error::{MergeError, Result};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use super::pipe::{pipe, PipeReader, PipeWriter};
use crate::oci::digest::format_digest;
use crate::pool::CancelToken;

/// Running sha256 of a segment's uncompressed bytes (its diff id).
///
/// Shared between the producer, which feeds it, and the consumer, which
/// finalizes it once the segment's stream has been fully drained.
#[derive(Debug, Clone, Default)]
pub struct DiffIdDigester(Arc<Mutex<Sha256>>);

impl DiffIdDigester {
    fn update(&self, data: &[u8]) {
        self.0.lock().update(data);
    }

    /// Digest of everything fed so far, as "sha256:<hex>".
    pub fn digest(&self) -> String {
        format_digest(self.0.lock().clone())
    }
}

/// One segment as seen by the consumer.
#[derive(Debug)]
pub struct SegmentHandle {
    /// Position of this segment within its task, starting at 0
    pub index: usize,
    /// Compressed bytes of the segment
    pub reader: PipeReader,
    /// Diff id digester, final once `reader` reaches end-of-stream
    pub digester: DiffIdDigester,
}

/// Counts gzip output on its way into the pipe.
struct CompressedSink {
    pipe: PipeWriter,
    written: u64,
}

impl Write for CompressedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.pipe.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pipe.flush()
    }
}

/// Compresses and hashes every byte the archive writer emits.
struct UncompressedSink {
    gz: GzEncoder<CompressedSink>,
    digester: DiffIdDigester,
    written: u64,
}

impl Write for UncompressedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.gz.write(buf)?;
        self.digester.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.gz.flush()
    }
}

/// Producer side of one segment.
struct Segment {
    archive: tar::Builder<UncompressedSink>,
}

impl Segment {
    /// Open a fresh segment and hand its read side to the consumer.
    fn open(index: usize, handoff: &mpsc::Sender<SegmentHandle>) -> Result<Self> {
        let (writer, reader) = pipe();
        let digester = DiffIdDigester::default();

        handoff
            .blocking_send(SegmentHandle {
                index,
                reader,
                digester: digester.clone(),
            })
            .map_err(|_| {
                MergeError::IoError(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "segment consumer went away",
                ))
            })?;

        let compressed = CompressedSink {
            pipe: writer,
            written: 0,
        };
        let sink = UncompressedSink {
            gz: GzEncoder::new(compressed, Compression::default()),
            digester,
            written: 0,
        };
        let mut archive = tar::Builder::new(sink);
        archive.follow_symlinks(false);
        Ok(Self { archive })
    }

    fn compressed(&self) -> u64 {
        self.archive.get_ref().gz.get_ref().written
    }

    fn uncompressed(&self) -> u64 {
        self.archive.get_ref().written
    }

    /// Push buffered compressor state into the pipe so `compressed()` is exact.
    fn flush(&mut self) -> Result<()> {
        self.archive.get_mut().flush()?;
        Ok(())
    }

    /// Write the tar and gzip trailers and close the pipe.
    fn finish(mut self) -> Result<()> {
        if let Err(e) = self.archive.finish() {
            let err = MergeError::from(e);
            self.abort(&err);
            return Err(err);
        }
        if let Err(e) = self.archive.get_mut().gz.try_finish() {
            let err = MergeError::from(e);
            self.abort(&err);
            return Err(err);
        }
        let sink = self.archive.into_inner()?;
        let mut compressed = sink.gz.finish()?;
        compressed.pipe.close();
        Ok(())
    }

    /// Poison the pipe so the consumer fails instead of committing a
    /// truncated stream.
    fn abort(mut self, err: &MergeError) {
        self.archive
            .get_mut()
            .gz
            .get_mut()
            .pipe
            .close_with_error(io::Error::new(io::ErrorKind::Other, err.to_string()));
    }
}

struct LayerEncoder {
    handoff: mpsc::Sender<SegmentHandle>,
    max_size: u64,
    policy: SplitPolicy,
    cancel: CancelToken,
    current: Option<Segment>,
    next_index: usize,
}

impl LayerEncoder {
    fn new(
        handoff: mpsc::Sender<SegmentHandle>,
        max_size: u64,
        policy: SplitPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            handoff,
            max_size,
            policy,
            cancel,
            current: None,
            next_index: 0,
        }
    }

    fn run(mut self, rootfses: &[PathBuf]) -> Result<()> {
        let result = self.open_segment().and_then(|()| {
            rootfses
                .iter()
                .try_for_each(|rootfs| self.append_rootfs(rootfs))
        });

        match (result, self.current.take()) {
            (Ok(()), Some(segment)) => segment.finish(),
            (Ok(()), None) => Ok(()),
            (Err(e), Some(segment)) => {
                segment.abort(&e);
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    fn open_segment(&mut self) -> Result<()> {
        // No segment is handed out once cancellation has been observed.
        self.cancel.check()?;
        self.current = Some(Segment::open(self.next_index, &self.handoff)?);
        self.next_index += 1;
        Ok(())
    }

    fn segment(&mut self) -> Result<&mut Segment> {
        self.current
            .as_mut()
            .ok_or_else(|| MergeError::Other("layer encoder has no open segment".to_string()))
    }

    fn append_rootfs(&mut self, rootfs: &Path) -> Result<()> {
        tracing::info!(rootfs = %rootfs.display(), "Importing rootfs");

        for item in WalkDir::new(rootfs).follow_links(false).sort_by_file_name() {
            self.cancel.check()?;

            let ent = item.map_err(|e| MergeError::WalkError {
                path: e.path().unwrap_or(rootfs).to_path_buf(),
                message: e.to_string(),
            })?;
            if ent.depth() == 0 {
                continue;
            }
            self.append_entry(rootfs, &ent)?;
        }
        Ok(())
    }

    fn append_entry(&mut self, rootfs: &Path, ent: &walkdir::DirEntry) -> Result<()> {
        let path = ent.path();
        let meta = ent.metadata().map_err(|e| MergeError::WalkError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let file_type = meta.file_type();
        // lstat size of any entry type: a symlink counts its target length.
        let entry_size = meta.len();

        self.maybe_split(entry_size)?;

        let name = path.strip_prefix(rootfs).map_err(|e| MergeError::WalkError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);

        let archive = &mut self.segment()?.archive;
        if file_type.is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| MergeError::WalkError {
                path: path.to_path_buf(),
                message: format!("Failed to read link: {}", e),
            })?;
            header.set_size(0);
            archive.append_link(&mut header, name, &target)?;
        } else if file_type.is_file() {
            let file = File::open(path)?;
            append_file_contents(archive, &mut header, name, file, entry_size, path)?;
        } else {
            header.set_size(0);
            archive.append_data(&mut header, name, io::empty())?;
        }
        Ok(())
    }

    /// Close the current segment and open the next one if writing an entry
    /// of `entry_size` bytes is projected to overrun the budget.
    fn maybe_split(&mut self, entry_size: u64) -> Result<()> {
        if self.max_size == 0 {
            return Ok(());
        }
        let max_size = self.max_size;
        let policy = self.policy;

        let segment = self.segment()?;
        if segment.uncompressed() == 0 {
            return Ok(());
        }
        segment.flush()?;
        let compressed = segment.compressed();
        let uncompressed = segment.uncompressed();
        if !policy.should_split(max_size, compressed, uncompressed, entry_size) {
            return Ok(());
        }

        tracing::debug!(
            segment = self.next_index - 1,
            compressed,
            uncompressed,
            entry_size,
            "Splitting layer"
        );
        if let Some(segment) = self.current.take() {
            segment.finish()?;
        }
        self.open_segment()
    }
}

/// Append a regular file whose size was recorded as `expected`.
///
/// Copies exactly `expected` bytes and fails with `SizeMismatch` if the
/// source turns out shorter or longer.
fn append_file_contents<W: Write, R: Read>(
    archive: &mut tar::Builder<W>,
    header: &mut tar::Header,
    name: &Path,
    mut src: R,
    expected: u64,
    source_path: &Path,
) -> Result<()> {
    header.set_size(expected);
    let mut counted = CountingReader {
        inner: (&mut src).take(expected),
        count: 0,
    };
    archive.append_data(header, name, &mut counted)?;

    let mismatch = |actual| MergeError::SizeMismatch {
        path: source_path.to_path_buf(),
        expected,
        actual,
    };
    if counted.count != expected {
        return Err(mismatch(counted.count));
    }
    let extra = io::copy(&mut src, &mut io::sink())?;
    if extra > 0 {
        return Err(mismatch(expected + extra));
    }
    Ok(())
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Start encoding `rootfses` into segments of at most `max_size`
/// compressed bytes (0 = one unbounded segment).
///
/// Returns the handoff receiver and the producer's join handle. Every
/// handle's reader must be drained before the next handle arrives. The
/// producer yields `MergeError::Cancelled` if `cancel` fires mid-walk.
pub fn encode(
    rootfses: Vec<PathBuf>,
    max_size: u64,
    policy: SplitPolicy,
    cancel: CancelToken,
) -> (mpsc::Receiver<SegmentHandle>, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(1);
    let producer = tokio::task::spawn_blocking(move || {
        LayerEncoder::new(tx, max_size, policy, cancel).run(&rootfses)
    });
    (rx, producer)
}
