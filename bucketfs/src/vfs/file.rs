//! Per-open-file state: sequential write buffering and multipart uploads.
//!
//! Writes accumulate in memory until `part_size` bytes are buffered, at which
//! point exactly one part is shipped. A flush either puts the whole buffer as
//! a single object or finishes the multipart session with the remainder.

use super::error::{FsError, FsResult};
use crate::cadapter::{BackendError, BackendResult, CompletedPart, ObjectBackend};
use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

struct Multipart {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

struct Pending {
    buf: BytesMut,
    /// Bytes accepted in this dirty cycle, shipped parts included.
    written: u64,
    multipart: Option<Multipart>,
}

impl Pending {
    fn empty() -> Self {
        Self {
            buf: BytesMut::new(),
            written: 0,
            multipart: None,
        }
    }
}

enum State {
    Clean,
    Dirty(Pending),
    /// An upload step failed; the next flush reports it.
    Failed(String),
}

pub struct FileHandle {
    ino: u64,
    key: String,
    part_size: usize,
    state: State,
    /// Set once the key is unlinked; writes are accepted but never uploaded.
    orphaned: bool,
}

impl FileHandle {
    /// Handle on an existing object.
    pub fn open(ino: u64, key: String, part_size: usize) -> Self {
        Self {
            ino,
            key,
            part_size,
            state: State::Clean,
            orphaned: false,
        }
    }

    /// Handle on a newly created file; flushing it without writes stores an
    /// empty object.
    pub fn create(ino: u64, key: String, part_size: usize) -> Self {
        Self {
            ino,
            key,
            part_size,
            state: State::Dirty(Pending::empty()),
            orphaned: false,
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_dirty(&self) -> bool {
        !matches!(self.state, State::Clean)
    }

    /// Reads straight from the backend. Past the end yields no bytes.
    pub async fn read<B>(&self, backend: &B, offset: u64, len: u64) -> FsResult<Bytes>
    where
        B: ObjectBackend + ?Sized,
    {
        match backend.get_range(&self.key, offset, len).await {
            Ok(data) => Ok(data),
            Err(BackendError::InvalidRange(_)) => Ok(Bytes::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends `data` at `offset`, which must equal the bytes written so far.
    /// Returns the total accepted in this dirty cycle.
    pub async fn write<B>(&mut self, backend: &B, offset: u64, data: &[u8]) -> FsResult<u64>
    where
        B: ObjectBackend + ?Sized,
    {
        let expected = match &self.state {
            State::Clean => 0,
            State::Dirty(pending) => pending.written,
            State::Failed(message) => return Err(FsError::Io(message.clone())),
        };
        if offset != expected {
            return Err(FsError::InvalidWrite { offset, expected });
        }
        if data.is_empty() {
            return Ok(expected);
        }
        if matches!(self.state, State::Clean) {
            self.state = State::Dirty(Pending::empty());
        }
        let State::Dirty(pending) = &mut self.state else {
            return Err(FsError::BadHandle(self.ino));
        };

        pending.written += data.len() as u64;
        let written = pending.written;
        if self.orphaned {
            return Ok(written);
        }
        pending.buf.extend_from_slice(data);

        while pending.buf.len() >= self.part_size {
            let part = pending.buf.split_to(self.part_size).freeze();
            if let Err(e) = ship_part(backend, &self.key, pending, part).await {
                error!(ino = self.ino, key = %self.key, error = %e, "part upload failed");
                if let Some(mp) = pending.multipart.take() {
                    abort_quietly(backend, &self.key, &mp.upload_id).await;
                }
                self.state = State::Failed(e.to_string());
                return Err(e.into());
            }
        }
        Ok(written)
    }

    /// Makes buffered writes durable. Returns the new object size when
    /// something was uploaded, `None` for a clean handle.
    pub async fn flush<B>(&mut self, backend: &B) -> FsResult<Option<u64>>
    where
        B: ObjectBackend + ?Sized,
    {
        let mut pending = match std::mem::replace(&mut self.state, State::Clean) {
            State::Clean => return Ok(None),
            State::Failed(message) => return Err(FsError::Io(message)),
            State::Dirty(pending) if self.orphaned => {
                debug!(
                    ino = self.ino,
                    key = %self.key,
                    size = pending.written,
                    "dropping writes to unlinked file"
                );
                return Ok(None);
            }
            State::Dirty(pending) => pending,
        };
        let size = pending.written;

        let result = match pending.multipart.take() {
            None => {
                debug!(ino = self.ino, key = %self.key, size, "single put");
                backend.put_object(&self.key, pending.buf.freeze()).await
            }
            Some(mp) => self.finish_multipart(backend, mp, pending.buf.freeze()).await,
        };
        match result {
            Ok(()) => Ok(Some(size)),
            Err(e) => {
                error!(ino = self.ino, key = %self.key, error = %e, "flush failed");
                Err(e.into())
            }
        }
    }

    async fn finish_multipart<B>(
        &self,
        backend: &B,
        mut mp: Multipart,
        rest: Bytes,
    ) -> BackendResult<()>
    where
        B: ObjectBackend + ?Sized,
    {
        let outcome = async {
            if !rest.is_empty() {
                let number = mp.parts.len() as i32 + 1;
                let part = backend
                    .upload_part(&self.key, &mp.upload_id, number, rest)
                    .await?;
                mp.parts.push(part);
            }
            backend
                .complete_multipart_upload(&self.key, &mp.upload_id, &mp.parts)
                .await
        }
        .await;
        match outcome {
            Ok(()) => {
                info!(
                    ino = self.ino,
                    key = %self.key,
                    upload_id = %mp.upload_id,
                    parts = mp.parts.len(),
                    "multipart upload completed"
                );
                Ok(())
            }
            Err(e) => {
                abort_quietly(backend, &self.key, &mp.upload_id).await;
                Err(e)
            }
        }
    }

    /// Detaches the handle from its key after an unlink. Buffered bytes and
    /// any open multipart session are dropped.
    pub async fn orphan<B>(&mut self, backend: &B)
    where
        B: ObjectBackend + ?Sized,
    {
        self.orphaned = true;
        if let State::Dirty(pending) = &mut self.state {
            if let Some(mp) = pending.multipart.take() {
                abort_quietly(backend, &self.key, &mp.upload_id).await;
            }
            pending.buf.clear();
        }
    }

    /// Discards buffered data and restarts an empty dirty cycle, so the next
    /// flush stores a zero-byte object.
    pub async fn truncate<B>(&mut self, backend: &B)
    where
        B: ObjectBackend + ?Sized,
    {
        if let State::Dirty(Pending {
            multipart: Some(mp),
            ..
        }) = &self.state
        {
            abort_quietly(backend, &self.key, &mp.upload_id).await;
        }
        self.state = State::Dirty(Pending::empty());
    }
}

async fn ship_part<B>(backend: &B, key: &str, pending: &mut Pending, part: Bytes) -> BackendResult<()>
where
    B: ObjectBackend + ?Sized,
{
    if pending.multipart.is_none() {
        let upload_id = backend.create_multipart_upload(key).await?;
        info!(key, upload_id = %upload_id, "multipart upload started");
        pending.multipart = Some(Multipart {
            upload_id,
            parts: Vec::new(),
        });
    }
    let Some(mp) = pending.multipart.as_mut() else {
        return Ok(());
    };
    let part_number = mp.parts.len() as i32 + 1;
    debug!(key, part_number, len = part.len(), "uploading part");
    let completed = backend
        .upload_part(key, &mp.upload_id, part_number, part)
        .await?;
    mp.parts.push(completed);
    Ok(())
}

async fn abort_quietly<B>(backend: &B, key: &str, upload_id: &str)
where
    B: ObjectBackend + ?Sized,
{
    if let Err(e) = backend.abort_multipart_upload(key, upload_id).await {
        warn!(key, upload_id, error = %e, "failed to abort multipart upload");
    }
}
