//! Input file cache consulted before a group's simulations are submitted
//!
//! The submission script hands over every input file url of the group, simulations still fetch
//! their own copies and may pick them up from the cache.

use crate::config::{CacheConfig, CacheKind, ConfigErrors};
use http::Uri;
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument};
use ureq::Agent;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to cache {url}: {reason}")]
    Unavailable { url: String, reason: String },
    #[error("Failed to write to the cache: {0}")]
    Io(#[from] io::Error),
}

pub trait InputCache {
    fn add_to_cache(&self, urls: &[&str]) -> Result<(), CacheError>;
}

/// Cache that keeps nothing, simulations fetch their input files themselves
#[derive(Debug, Default, Clone)]
pub struct NoCache;

impl InputCache for NoCache {
    fn add_to_cache(&self, urls: &[&str]) -> Result<(), CacheError> {
        info!(files = urls.len(), "No input file cache configured, skipping");

        Ok(())
    }
}

/// Downloads input files into a shared directory, files already present are not fetched again
pub struct DirectoryCache {
    path: PathBuf,
    agent: Agent,
}

impl DirectoryCache {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let agent = Agent::new_with_config(
            Agent::config_builder()
                .timeout_global(Some(timeout))
                .build(),
        );

        Self {
            path: path.into(),
            agent,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// location of a url's content inside the cache
    ///
    /// Every byte outside `[A-Za-z0-9.-]` is escaped as `_XX`, so distinct urls never share an
    /// entry.
    pub fn entry(&self, url: &str) -> PathBuf {
        let mut name = String::with_capacity(url.len());
        for byte in url.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => name.push(byte as char),
                _ => name.push_str(&format!("_{byte:02X}")),
            }
        }

        self.path.join(name)
    }

    fn fetch(&self, url: &str, target: &Path) -> Result<(), CacheError> {
        let unavailable = |reason: String| CacheError::Unavailable {
            url: url.to_owned(),
            reason,
        };

        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| unavailable(e.to_string()))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            scheme => return Err(unavailable(format!("unsupported scheme {scheme:?}"))),
        }

        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| unavailable(e.to_string()))?;

        // download next to the entry, so a partial file is never picked up. `_p` never occurs
        // in an entry name, escapes are followed by hex digits
        let mut partial = target.as_os_str().to_owned();
        partial.push("_partial");
        let partial = PathBuf::from(partial);
        let download = File::create(&partial).and_then(|mut file| {
            io::copy(&mut response.into_body().into_reader(), &mut file)?;
            fs::rename(&partial, target)
        });

        if let Err(e) = download {
            if let Err(e) = fs::remove_file(&partial) {
                debug!(error = ?e, path = ?partial, "Failed to remove partial download");
            }

            return Err(e.into());
        }

        Ok(())
    }
}

impl InputCache for DirectoryCache {
    #[instrument(skip(self, urls), fields(path = ?self.path), level = "debug")]
    fn add_to_cache(&self, urls: &[&str]) -> Result<(), CacheError> {
        for url in urls {
            let entry = self.entry(url);
            if entry.is_file() {
                debug!(url, "Input file already cached");
                continue;
            }

            self.fetch(url, &entry)?;
            info!(url, entry = ?entry, "Cached input file");
        }

        Ok(())
    }
}

pub enum InputCaches {
    None(NoCache),
    Directory(DirectoryCache),
}

impl InputCaches {
    pub fn load(config: &CacheConfig, timeout: Duration) -> Result<Self, ConfigErrors> {
        match config.name {
            CacheKind::None => Ok(Self::None(NoCache)),
            CacheKind::Directory => match &config.path {
                Some(path) => Ok(Self::Directory(DirectoryCache::new(path, timeout))),
                None => Err(ConfigErrors::InvalidParameter {
                    name: "cache.path".to_owned(),
                    reason: "required for the directory cache".to_owned(),
                }),
            },
        }
    }
}

impl InputCache for InputCaches {
    fn add_to_cache(&self, urls: &[&str]) -> Result<(), CacheError> {
        match self {
            Self::None(cache) => cache.add_to_cache(urls),
            Self::Directory(cache) => cache.add_to_cache(urls),
        }
    }
}
