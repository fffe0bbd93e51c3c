//! Remote release metadata, tree listings and raw file downloads.
//!
//! The endpoints follow the GitHub REST layout: latest release for the tag,
//! the contents API for directory listings and raw.githubusercontent.com for
//! file bodies. Everything goes through [`HttpTransport`] so the device HTTP
//! client and test doubles are interchangeable.

use std::io::{Read, Write};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{FetchError, NetworkError, ParseError, StorageError};
use crate::storage::Storage;

/// Download chunk size. Files are never held in memory whole.
pub const DOWNLOAD_CHUNK: usize = 1024;

const API_BASE: &str = "https://api.github.com";
const RAW_BASE: &str = "https://raw.githubusercontent.com";
const USER_AGENT: &str = "esp32-home-node";

pub struct HttpResponse<'a> {
    pub status: u16,
    pub body: Box<dyn Read + 'a>,
}

pub trait HttpTransport: Send {
    /// Issues a GET. The returned body borrows the transport, so only one
    /// response is alive at a time.
    fn get<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse<'a>, NetworkError>;
}

/// Where releases are published.
#[derive(Debug, Clone, Default)]
pub struct RepoConfig {
    /// `owner/name`; a full `https://github.com/owner/name` URL is accepted.
    pub repo: String,
    /// Subdirectory of the repository holding the sources, may be empty.
    pub src_dir: String,
    /// Directory mirrored onto the device.
    pub main_dir: String,
    /// Bearer token for private repositories.
    pub token: Option<String>,
}

impl RepoConfig {
    pub fn new(repo: &str, main_dir: &str) -> Self {
        Self {
            repo: repo.to_string(),
            main_dir: main_dir.to_string(),
            ..Default::default()
        }
    }

    fn repo_slug(&self) -> &str {
        self.repo
            .trim_end_matches('/')
            .trim_start_matches("https://github.com/")
    }

    fn src_prefix(&self) -> String {
        let src = self.src_dir.trim_matches('/');
        if src.is_empty() {
            String::new()
        } else {
            format!("{src}/")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntryType {
    File,
    Dir,
    #[serde(other)]
    Other,
}

/// One entry of a contents listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: TreeEntryType,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

/// Result of streaming one file into storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub bytes: u64,
    pub sha256: String,
}

pub struct RemoteArtifactFetcher<T: HttpTransport> {
    transport: T,
    repo: RepoConfig,
}

impl<T: HttpTransport> RemoteArtifactFetcher<T> {
    pub fn new(transport: T, repo: RepoConfig) -> Self {
        Self { transport, repo }
    }

    pub fn repo(&self) -> &RepoConfig {
        &self.repo
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Accept", "application/vnd.github+json".to_string()),
            ("X-GitHub-Api-Version", "2022-11-28".to_string()),
            ("User-Agent", USER_AGENT.to_string()),
        ];
        if let Some(token) = self.repo.token.as_deref().filter(|t| !t.is_empty()) {
            headers.push(("Authorization", format!("Bearer {token}")));
        }
        headers
    }

    fn get(&mut self, url: &str) -> Result<HttpResponse<'_>, NetworkError> {
        let owned = self.headers();
        let headers: Vec<(&str, &str)> = owned.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let response = self.transport.get(url, &headers)?;
        if !(200..300).contains(&response.status) {
            return Err(NetworkError::from_status(url, response.status));
        }
        Ok(response)
    }

    pub fn release_url(&self) -> String {
        format!("{API_BASE}/repos/{}/releases/latest", self.repo.repo_slug())
    }

    pub fn contents_url(&self, git_ref: &str, subpath: &str) -> String {
        format!(
            "{API_BASE}/repos/{}/contents/{}{}{}?ref=refs/tags/{}",
            self.repo.repo_slug(),
            self.repo.src_prefix(),
            self.repo.main_dir.trim_matches('/'),
            subpath,
            git_ref
        )
    }

    pub fn raw_url(&self, git_ref: &str, remote_path: &str) -> String {
        format!(
            "{RAW_BASE}/{}/{}/{}",
            self.repo.repo_slug(),
            git_ref,
            remote_path.trim_start_matches('/')
        )
    }

    /// Tag name of the latest published release.
    pub fn fetch_latest_version(&mut self) -> Result<String, FetchError> {
        let url = self.release_url();
        log::debug!("fetcher: GET {}", url);
        let response = self.get(&url)?;
        let release: Release = serde_json::from_reader(response.body)
            .map_err(|e| ParseError::new("release metadata", e))?;
        let tag = release.tag_name.trim().to_string();
        if tag.is_empty() {
            return Err(ParseError::new("release metadata", "empty tag_name").into());
        }
        Ok(tag)
    }

    /// Single directory listing, decoded straight from the response stream.
    fn list_dir(&mut self, git_ref: &str, subpath: &str) -> Result<Vec<TreeEntry>, FetchError> {
        let url = self.contents_url(git_ref, subpath);
        log::debug!("fetcher: GET {}", url);
        let response = self.get(&url)?;
        let entries: Vec<TreeEntry> = serde_json::from_reader(response.body)
            .map_err(|e| ParseError::new(format!("tree listing {subpath:?}"), e))?;
        Ok(entries)
    }

    /// Lazy depth-first walk of the remote tree under `subpath`.
    pub fn list_tree<'f>(&'f mut self, git_ref: &str, subpath: &str) -> TreeWalk<'f, T> {
        TreeWalk {
            fetcher: self,
            git_ref: git_ref.to_string(),
            stack: Vec::new(),
            pending: Some(subpath.to_string()),
            failed: false,
        }
    }

    /// Streams a raw file into `local_path`, overwriting it.
    pub fn download_file(
        &mut self,
        storage: &dyn Storage,
        git_ref: &str,
        remote_path: &str,
        local_path: &str,
    ) -> Result<Downloaded, FetchError> {
        let url = self.raw_url(git_ref, remote_path);
        let response = self.get(&url)?;
        let mut body = response.body;
        let mut writer = storage.create(local_path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; DOWNLOAD_CHUNK];
        let mut total = 0u64;
        loop {
            let n = body.read(&mut buf).map_err(|source| NetworkError::Body {
                url: url.clone(),
                source,
            })?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .map_err(|e| StorageError::from_io(local_path, e))?;
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        writer
            .flush()
            .map_err(|e| StorageError::from_io(local_path, e))?;
        Ok(Downloaded {
            bytes: total,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    /// Maps a remote path to its location relative to the mirrored root.
    pub fn relative_path<'p>(&self, remote_path: &'p str) -> &'p str {
        let without_src = remote_path
            .strip_prefix(self.repo.src_prefix().as_str())
            .unwrap_or(remote_path);
        let main = self.repo.main_dir.trim_matches('/');
        if main.is_empty() {
            return without_src;
        }
        without_src
            .strip_prefix(main)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(without_src)
    }
}

/// Iterator returned by [`RemoteArtifactFetcher::list_tree`].
///
/// Directories are yielded before their children; a directory's listing is
/// requested only when the walk reaches it.
pub struct TreeWalk<'f, T: HttpTransport> {
    fetcher: &'f mut RemoteArtifactFetcher<T>,
    git_ref: String,
    stack: Vec<(String, std::vec::IntoIter<TreeEntry>)>,
    pending: Option<String>,
    failed: bool,
}

impl<'f, T: HttpTransport> TreeWalk<'f, T> {
    /// Gives the fetcher back so files can be downloaded mid-walk.
    pub fn fetcher(&mut self) -> &mut RemoteArtifactFetcher<T> {
        self.fetcher
    }
}

impl<T: HttpTransport> Iterator for TreeWalk<'_, T> {
    type Item = Result<TreeEntry, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(subpath) = self.pending.take() {
            match self.fetcher.list_dir(&self.git_ref, &subpath) {
                Ok(entries) => self.stack.push((subpath, entries.into_iter())),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        loop {
            let (subpath, entries) = self.stack.last_mut()?;
            match entries.next() {
                Some(entry) => {
                    if entry.kind == TreeEntryType::Dir {
                        self.pending = Some(format!("{}/{}", subpath, entry.name));
                    }
                    return Some(Ok(entry));
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
