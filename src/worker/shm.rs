//! Frame payload hand-off to worker processes
//!
//! With the shared-memory transport each binding owns one memory-mapped file.
//! It is overwritten on every dispatch, which is safe because a worker never
//! has more than one frame in flight.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};
use tracing::{debug, warn};

use super::protocol::PayloadRef;
use crate::ids::BindingKey;
use crate::utils::file_component;
use crate::{Frame, FrameTransport, TransportConfig};

/// Distinguishes export files whose sanitised ids collide
static EXPORT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Memory-mapped export file for one binding
pub struct ShmExporter {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
}

/// How a dispatcher turns a frame into a [`PayloadRef`]
pub enum PayloadEncoder {
    Shared(ShmExporter),
    Inline,
}

impl ShmExporter {
    pub fn create(dir: &Path, key: &BindingKey) -> io::Result<Self> {
        let name = format!(
            "argus-{}-{}-{}-{}-{}.frame",
            std::process::id(),
            EXPORT_SERIAL.fetch_add(1, Ordering::Relaxed),
            file_component(key.camera.as_str()),
            key.tier,
            file_component(key.plugin.as_str())
        );
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        debug!(path = %path.display(), "created shared-memory export");
        Ok(Self {
            path,
            file,
            map: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy `data` into the mapping, growing it when needed
    pub fn export(&mut self, data: &[u8]) -> io::Result<PayloadRef> {
        if !data.is_empty() {
            let capacity = self.map.as_ref().map(|m| m.len()).unwrap_or(0);
            if capacity < data.len() {
                self.map = None;
                self.file.set_len(data.len() as u64)?;
                // SAFETY: the file is private to this exporter and only ever
                // resized while no mapping is alive.
                self.map = Some(unsafe { MmapMut::map_mut(&self.file)? });
            }

            if let Some(map) = self.map.as_mut() {
                map[..data.len()].copy_from_slice(data);
            }
        }

        Ok(PayloadRef::Shared {
            path: self.path.clone(),
            offset: 0,
            len: data.len(),
        })
    }
}

impl Drop for ShmExporter {
    fn drop(&mut self) {
        self.map = None;
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "failed to remove export file: {}", e);
        }
    }
}

impl PayloadEncoder {
    /// Pick the configured transport, falling back to inline payloads when
    /// the export file can't be created.
    pub fn for_binding(transport: &TransportConfig, key: &BindingKey) -> Self {
        match transport.mode {
            FrameTransport::Inline => PayloadEncoder::Inline,
            FrameTransport::SharedMemory => match ShmExporter::create(&transport.shm_dir, key) {
                Ok(exporter) => PayloadEncoder::Shared(exporter),
                Err(e) => {
                    warn!(
                        binding = %key,
                        dir = %transport.shm_dir.display(),
                        "shared-memory export unavailable, sending frames inline: {}",
                        e
                    );
                    PayloadEncoder::Inline
                }
            },
        }
    }

    pub fn encode(&mut self, frame: &Frame) -> io::Result<PayloadRef> {
        match self {
            PayloadEncoder::Shared(exporter) => exporter.export(&frame.data),
            PayloadEncoder::Inline => Ok(PayloadRef::Inline(frame.data.clone())),
        }
    }
}

/// Worker side: fetch the bytes a payload reference points at
pub fn read_payload(payload: &PayloadRef) -> io::Result<Bytes> {
    match payload {
        PayloadRef::Inline(data) => Ok(data.clone()),
        PayloadRef::Shared { len: 0, .. } => Ok(Bytes::new()),
        PayloadRef::Shared { path, offset, len } => {
            let file = File::open(path)?;
            // SAFETY: the host only rewrites the mapping after this frame's
            // result has been received.
            let map = unsafe { Mmap::map(&file)? };

            let start = usize::try_from(*offset)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
            let end = start
                .checked_add(*len)
                .filter(|end| *end <= map.len())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "payload extends past the shared-memory export",
                    )
                })?;

            Ok(Bytes::copy_from_slice(&map[start..end]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};

    fn frame(fill: u8, len: usize) -> Frame {
        Frame::new(
            FrameMetadata::packed(1, 0, 1, 1, PixelFormat::Rgb24),
            vec![fill; len],
        )
    }

    #[test]
    fn shared_export_is_readable_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let key = BindingKey::new("front door", "yolo");
        let mut exporter = ShmExporter::create(dir.path(), &key).unwrap();
        assert!(exporter
            .path()
            .to_string_lossy()
            .ends_with("front_door-0-yolo.frame"));

        let big = exporter.export(&[7u8; 64]).unwrap();
        assert_eq!(read_payload(&big).unwrap(), Bytes::from(vec![7u8; 64]));

        // Smaller frames reuse the existing mapping.
        let small = exporter.export(&[9u8; 16]).unwrap();
        assert!(matches!(small, PayloadRef::Shared { len: 16, .. }));
        assert_eq!(read_payload(&small).unwrap(), Bytes::from(vec![9u8; 16]));
    }

    #[test]
    fn export_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ShmExporter::create(dir.path(), &BindingKey::new("a", "b")).unwrap();
        let path = exporter.path().to_path_buf();
        assert!(path.exists());
        drop(exporter);
        assert!(!path.exists());
    }

    #[test]
    fn out_of_range_reference_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = ShmExporter::create(dir.path(), &BindingKey::new("a", "b")).unwrap();
        let PayloadRef::Shared { path, .. } = exporter.export(&[1u8; 8]).unwrap() else {
            panic!("expected shared payload");
        };

        let bogus = PayloadRef::Shared {
            path,
            offset: 4,
            len: 8,
        };
        assert!(read_payload(&bogus).is_err());
    }

    #[test]
    fn encoder_falls_back_to_inline() {
        let transport = TransportConfig {
            mode: FrameTransport::SharedMemory,
            shm_dir: PathBuf::from("/nonexistent/argus"),
        };
        let mut encoder = PayloadEncoder::for_binding(&transport, &BindingKey::new("a", "b"));
        assert!(matches!(encoder, PayloadEncoder::Inline));

        let payload = encoder.encode(&frame(3, 6)).unwrap();
        assert_eq!(payload, PayloadRef::Inline(Bytes::from(vec![3u8; 6])));
    }

    #[test]
    fn colliding_ids_get_separate_exports() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = ShmExporter::create(dir.path(), &BindingKey::new("gate-1", "yolo")).unwrap();
        let mut b = ShmExporter::create(dir.path(), &BindingKey::new("gate", "1-yolo")).unwrap();
        let mut c = ShmExporter::create(dir.path(), &BindingKey::new("cam 1", "yolo")).unwrap();
        let mut d = ShmExporter::create(dir.path(), &BindingKey::new("cam_1", "yolo")).unwrap();
        assert_ne!(a.path(), b.path());
        assert_ne!(c.path(), d.path());

        let from_a = a.export(&[1u8; 8]).unwrap();
        b.export(&[2u8; 8]).unwrap();
        let from_c = c.export(&[3u8; 8]).unwrap();
        d.export(&[4u8; 8]).unwrap();
        assert_eq!(read_payload(&from_a).unwrap(), Bytes::from(vec![1u8; 8]));
        assert_eq!(read_payload(&from_c).unwrap(), Bytes::from(vec![3u8; 8]));

        let b_path = b.path().to_path_buf();
        drop(a);
        assert!(b_path.exists());
    }
}
