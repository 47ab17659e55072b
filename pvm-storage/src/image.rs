// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to image contents for uploads.

use crate::driver::{ImageMeta, RequestContext};
use crate::error::Error;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use pvm_client::UploadStream;
use std::io;

/// Image contents, as produced by the image service.
pub type ImageChunks = Box<dyn Iterator<Item = io::Result<Bytes>> + Send>;

/// The image service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageApi: Send + Sync {
    async fn download(
        &self,
        ctx: &RequestContext,
        image_id: &str,
    ) -> Result<ImageChunks, anyhow::Error>;
}

/// Reads from a sequence of chunks.
///
/// The API wants something it can pull from while the image service hands
/// out chunks of arbitrary size.
pub struct ImageStream {
    chunks: ImageChunks,
    remaining: Bytes,
}

impl ImageStream {
    pub fn new(chunks: ImageChunks) -> Self {
        Self { chunks, remaining: Bytes::new() }
    }
}

impl io::Read for ImageStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while !self.remaining.has_remaining() {
            match self.chunks.next() {
                Some(chunk) => self.remaining = chunk?,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.remaining.len());
        buf[..n].copy_from_slice(&self.remaining[..n]);
        self.remaining.advance(n);
        Ok(n)
    }
}

/// Starts downloading `image`, returning a stream to upload from.
pub(crate) async fn image_upload(
    image_api: &dyn ImageApi,
    ctx: &RequestContext,
    image: &ImageMeta,
) -> Result<UploadStream, Error> {
    let chunks = image_api
        .download(ctx, &image.id)
        .await
        .map_err(|err| Error::ImageDownload {
            image_id: image.id.clone(),
            err,
        })?;
    Ok(Box::new(ImageStream::new(chunks)))
}

/// Serves each image from a fixed byte buffer.
#[cfg(test)]
pub(crate) struct StaticImageApi {
    pub contents: Bytes,
    pub chunk_size: usize,
}

#[cfg(test)]
#[async_trait]
impl ImageApi for StaticImageApi {
    async fn download(
        &self,
        _ctx: &RequestContext,
        _image_id: &str,
    ) -> Result<ImageChunks, anyhow::Error> {
        let contents = self.contents.clone();
        let chunk_size = self.chunk_size.max(1);
        let chunks: Vec<io::Result<Bytes>> = (0..contents.len())
            .step_by(chunk_size)
            .map(|start| {
                let end = (start + chunk_size).min(contents.len());
                Ok(contents.slice(start..end))
            })
            .collect();
        Ok(Box::new(chunks.into_iter()))
    }
}
