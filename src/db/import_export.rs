//! URL-list import, merge and export.
//!
//! The wire format is one URL per line, optionally gzip- or zlib-compressed.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use thiserror::Error;

use super::{Database, DbError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Plain,
    Gzip,
    Zlib,
}

#[derive(Debug, Error)]
pub enum ImportExportError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),
    #[error("import payload is not valid UTF-8")]
    Encoding,
}

impl Database {
    /// Export all URLs of a list, one per line, through the chosen codec.
    pub async fn export_url_list(
        &self,
        ns: &str,
        codec: Codec,
    ) -> Result<Vec<u8>, ImportExportError> {
        let urls = self.all_urls(ns).await?;

        let mut text = String::new();

        for (_, url) in urls {
            text.push_str(&url);
            text.push('\n');
        }

        Ok(match codec {
            Codec::Plain => text.into_bytes(),
            Codec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

                encoder.write_all(text.as_bytes())?;
                encoder.finish()?
            }
            Codec::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());

                encoder.write_all(text.as_bytes())?;
                encoder.finish()?
            }
        })
    }

    /// Import URLs into a list, skipping ones already present. Returns the
    /// number of new URLs.
    pub async fn import_url_list(
        &self,
        ns: &str,
        data: &[u8],
        codec: Codec,
    ) -> Result<u64, ImportExportError> {
        let text = match codec {
            Codec::Plain => String::from_utf8(data.to_vec())
                .map_err(|_| ImportExportError::Encoding)?,
            Codec::Gzip => {
                let mut decoder = GzDecoder::new(data);
                let mut text = String::new();

                decoder
                    .read_to_string(&mut text)
                    .map_err(|_| ImportExportError::Encoding)?;

                text
            }
            Codec::Zlib => {
                let mut decoder = ZlibDecoder::new(data);
                let mut text = String::new();

                decoder
                    .read_to_string(&mut text)
                    .map_err(|_| ImportExportError::Encoding)?;

                text
            }
        };

        let urls: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(self.add_urls(ns, &urls).await?)
    }

    /// Merge one URL list into another (both already namespaced). Returns
    /// the number of URLs new to the target.
    pub async fn merge_url_lists(&self, from_ns: &str, into_ns: &str) -> Result<u64, DbError> {
        let urls: Vec<String> = self
            .all_urls(from_ns)
            .await?
            .into_iter()
            .map(|(_, url)| url)
            .collect();

        self.add_urls(into_ns, &urls).await
    }
}
