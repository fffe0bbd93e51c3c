//! Staged over-the-air update of the application tree.
//!
//! A newer release is mirrored file by file into the staging directory,
//! verified against what was streamed, and then swapped into place. With a
//! rename-capable filesystem the old install is kept aside until the new one
//! is in place so a failed swap can be rolled back.

use std::io::Read;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::collaborators::{notify_best_effort, Telemetry};
use crate::error::{FetchError, ParseError, StorageError, SwapError, VerifyError};
use crate::fetcher::{HttpTransport, RemoteArtifactFetcher, TreeEntryType};
use crate::storage::{self, Storage, COPY_CHUNK};
use crate::version;

const PROBE_DIR: &str = "otaUpdater";
const PROBE_CHILD: &str = "osRenameTest";
const PROBE_RENAMED: &str = "otaUpdated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Idle,
    Checking,
    MarkerWritten,
    Downloading,
    Verified,
    SecretsCopied,
    OldRemoved,
    Installed,
    Notified,
}

#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Directory all other paths live under, `""` for the storage root.
    pub module: String,
    pub main_dir: String,
    pub staging_dir: String,
    /// Old install is parked here during a rename swap.
    pub backup_dir: String,
    /// Files under `main_dir` carried into each new install.
    pub secret_files: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            module: String::new(),
            main_dir: "main".to_string(),
            staging_dir: "next".to_string(),
            backup_dir: "main.bak".to_string(),
            secret_files: Vec::new(),
        }
    }
}

/// One file streamed into staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    /// Size announced by the tree listing.
    pub expected_size: Option<u64>,
    pub bytes: u64,
    pub sha256: String,
}

/// Brings the station up for the post-boot install.
pub trait StationLink {
    /// Connects and waits a bounded time. True once associated.
    fn connect_station(&mut self, ssid: &str, password: &str) -> bool;
}

/// Lets the portal trigger a check without knowing the transport type.
pub trait UpdateCheck: Send + Sync {
    fn check_for_update(&self) -> bool;
}

pub struct UpdateInstaller<T: HttpTransport> {
    fetcher: Mutex<RemoteArtifactFetcher<T>>,
    storage: Arc<dyn Storage>,
    telemetry: Arc<dyn Telemetry>,
    config: InstallerConfig,
    rename_supported: OnceLock<bool>,
    phase: Mutex<InstallPhase>,
}

impl<T: HttpTransport> UpdateInstaller<T> {
    pub fn new(
        fetcher: RemoteArtifactFetcher<T>,
        storage: Arc<dyn Storage>,
        telemetry: Arc<dyn Telemetry>,
        config: InstallerConfig,
    ) -> Self {
        Self {
            fetcher: Mutex::new(fetcher),
            storage,
            telemetry,
            config,
            rename_supported: OnceLock::new(),
            phase: Mutex::new(InstallPhase::Idle),
        }
    }

    pub fn main_path(&self) -> String {
        storage::join(&self.config.module, &self.config.main_dir)
    }

    pub fn staging_path(&self) -> String {
        storage::join(&self.config.module, &self.config.staging_dir)
    }

    fn backup_path(&self) -> String {
        storage::join(&self.config.module, &self.config.backup_dir)
    }

    /// Version marker of the running install.
    pub fn installed_version(&self) -> String {
        version::read(self.storage.as_ref(), &self.main_path())
    }

    /// Last phase reached by the pipeline.
    pub fn phase(&self) -> InstallPhase {
        self.phase.lock().map(|p| *p).unwrap_or(InstallPhase::Idle)
    }

    fn enter(&self, phase: InstallPhase) {
        log::debug!("ota: phase {:?}", phase);
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    fn staging_marker_exists(&self) -> bool {
        self.storage
            .exists(&storage::join(&self.staging_path(), version::VERSION_FILE))
    }

    /// Newer tag when one is published. Removes a stale staging tree when
    /// the check succeeds and nothing newer exists.
    fn newer_version(&self, fetcher: &mut RemoteArtifactFetcher<T>) -> Option<String> {
        self.enter(InstallPhase::Checking);
        let current = self.installed_version();
        let latest = match fetcher.fetch_latest_version() {
            Ok(tag) => tag,
            Err(e) => {
                log::warn!("ota: version check failed: {}", e);
                self.enter(InstallPhase::Idle);
                return None;
            }
        };
        log::info!("ota: installed {} latest {}", current, latest);
        if version::compare(&current, &latest) {
            return Some(latest);
        }
        self.enter(InstallPhase::Idle);
        let staging = self.staging_path();
        if self.storage.is_dir(&staging) {
            log::info!("ota: removing stale staging tree '{}'", staging);
            if let Err(e) = storage::rmtree(self.storage.as_ref(), &staging) {
                log::warn!("ota: could not remove '{}': {}", staging, e);
            }
        }
        None
    }

    /// Checks for a newer release and records it in the staging marker so
    /// the next boot installs it.
    pub fn check_for_update(&self) -> bool {
        let Ok(mut fetcher) = self.fetcher.lock() else {
            log::error!("ota: fetcher lock poisoned");
            return false;
        };
        let Some(latest) = self.newer_version(&mut fetcher) else {
            return false;
        };
        match version::write(self.storage.as_ref(), &self.staging_path(), &latest) {
            Ok(()) => {
                self.enter(InstallPhase::MarkerWritten);
                log::info!("ota: {} staged for install on next boot", latest);
                true
            }
            Err(e) => {
                log::warn!("ota: could not write staging marker: {}", e);
                self.enter(InstallPhase::Idle);
                false
            }
        }
    }

    /// Installs the latest release right away when it is newer.
    ///
    /// `Ok(false)` covers every failure before the swap: the old install is
    /// untouched. Only storage failures during the swap are returned.
    pub fn install_if_available(&self) -> Result<bool, SwapError> {
        let staged = {
            let Ok(mut fetcher) = self.fetcher.lock() else {
                log::error!("ota: fetcher lock poisoned");
                return Ok(false);
            };
            let Some(latest) = self.newer_version(&mut fetcher) else {
                return Ok(false);
            };
            log::info!("ota: updating to {}", latest);
            match self.stage(&mut fetcher, &latest) {
                Ok(manifest) => (latest, manifest),
                Err(e) => {
                    log::warn!("ota: staging {} failed: {}", latest, e);
                    self.enter(InstallPhase::Idle);
                    return Ok(false);
                }
            }
        };
        let (latest, manifest) = staged;

        if let Err(e) = self.verify(&manifest) {
            log::warn!("ota: {}", e);
            self.enter(InstallPhase::Idle);
            return Ok(false);
        }
        self.enter(InstallPhase::Verified);

        if let Err(e) = self.copy_secrets() {
            log::warn!("ota: copying secrets failed: {}", e);
            self.enter(InstallPhase::Idle);
            return Ok(false);
        }
        self.enter(InstallPhase::SecretsCopied);

        self.swap()?;
        self.enter(InstallPhase::Installed);
        log::info!("ota: installed {}", latest);

        let installed = self.installed_version();
        notify_best_effort(
            self.telemetry.as_ref(),
            "ota_update",
            &json!({ "version": installed, "source": "ota_update" }),
        );
        self.enter(InstallPhase::Notified);
        Ok(true)
    }

    /// Boot-time entry point. Touches the radio only when a staging marker
    /// exists; a failed connect keeps the marker for the next boot.
    pub fn install_after_boot_if_staged(
        &self,
        link: &mut dyn StationLink,
        ssid: &str,
        password: &str,
    ) -> Result<bool, SwapError> {
        if !self.staging_marker_exists() {
            log::info!("ota: no staged update");
            return Ok(false);
        }
        let pending = version::read(self.storage.as_ref(), &self.staging_path());
        log::info!("ota: staged update {} found", pending);
        if !link.connect_station(ssid, password) {
            log::warn!("ota: station did not connect, install postponed");
            return Ok(false);
        }
        self.install_if_available()
    }

    /// Writes a fresh staging tree for `tag` and records what was streamed.
    fn stage(
        &self,
        fetcher: &mut RemoteArtifactFetcher<T>,
        tag: &str,
    ) -> Result<Vec<ManifestEntry>, FetchError> {
        let store = self.storage.as_ref();
        let staging = self.staging_path();
        if store.is_dir(&staging) {
            storage::rmtree(store, &staging)?;
        }
        version::write(store, &staging, tag)?;
        self.enter(InstallPhase::MarkerWritten);

        self.enter(InstallPhase::Downloading);
        let mut manifest = Vec::new();
        let mut walk = fetcher.list_tree(tag, "");
        while let Some(entry) = walk.next() {
            let entry = entry?;
            let relative = walk.fetcher().relative_path(&entry.path).to_string();
            if relative.split('/').any(|part| part == "..") {
                return Err(ParseError::new(entry.path, "path leaves the release tree").into());
            }
            let local = storage::join(&staging, &relative);
            match entry.kind {
                TreeEntryType::Dir => storage::mkdirs(store, &local)?,
                TreeEntryType::File => {
                    storage::mkdirs(store, storage::parent(&local))?;
                    let got = walk
                        .fetcher()
                        .download_file(store, tag, &entry.path, &local)?;
                    log::debug!("ota: {} ({} bytes)", local, got.bytes);
                    manifest.push(ManifestEntry {
                        path: local,
                        expected_size: entry.size,
                        bytes: got.bytes,
                        sha256: got.sha256,
                    });
                }
                TreeEntryType::Other => log::debug!("ota: skipping {}", entry.path),
            }
        }
        Ok(manifest)
    }

    /// Re-reads every staged file and checks it against the manifest.
    fn verify(&self, manifest: &[ManifestEntry]) -> Result<(), VerifyError> {
        if manifest.is_empty() {
            return Err(VerifyError {
                path: self.staging_path(),
                reason: "release contains no files".to_string(),
            });
        }
        for entry in manifest {
            let fail = |reason: String| VerifyError {
                path: entry.path.clone(),
                reason,
            };
            if let Some(expected) = entry.expected_size {
                if expected != entry.bytes {
                    return Err(fail(format!(
                        "downloaded {} of {} bytes",
                        entry.bytes, expected
                    )));
                }
            }
            let digest = hash_file(self.storage.as_ref(), &entry.path)
                .map_err(|e| fail(e.to_string()))?;
            if digest != entry.sha256 {
                return Err(fail("content changed after download".to_string()));
            }
        }
        Ok(())
    }

    fn copy_secrets(&self) -> Result<(), StorageError> {
        let store = self.storage.as_ref();
        for name in &self.config.secret_files {
            let from = storage::join(&self.main_path(), name);
            let to = storage::join(&self.staging_path(), name);
            if !store.exists(&from) {
                log::debug!("ota: secret '{}' not present, skipped", from);
                continue;
            }
            storage::mkdirs(store, storage::parent(&to))?;
            storage::copy_file(store, &from, &to)?;
            log::info!("ota: carried '{}' into new install", name);
        }
        Ok(())
    }

    fn supports_rename(&self) -> bool {
        *self.rename_supported.get_or_init(|| {
            let supported = self.probe_rename();
            log::info!("ota: storage rename supported: {}", supported);
            supported
        })
    }

    fn probe_rename(&self) -> bool {
        let store = self.storage.as_ref();
        let from = storage::join(&self.config.module, PROBE_DIR);
        let to = storage::join(&self.config.module, PROBE_RENAMED);
        let result = storage::mkdirs(store, &storage::join(&from, PROBE_CHILD))
            .and_then(|_| store.rename(&from, &to))
            .and_then(|_| store.list(&to))
            .map(|entries| !entries.is_empty());
        for leftover in [&from, &to] {
            if store.is_dir(leftover) {
                let _ = storage::rmtree(store, leftover);
            }
        }
        match result {
            Ok(supported) => supported,
            Err(e) => {
                log::debug!("ota: rename probe failed: {}", e);
                false
            }
        }
    }

    fn swap(&self) -> Result<(), SwapError> {
        if self.supports_rename() {
            self.swap_by_rename()
        } else {
            self.swap_by_copy()
        }
    }

    fn swap_by_rename(&self) -> Result<(), SwapError> {
        let store = self.storage.as_ref();
        let main = self.main_path();
        let staging = self.staging_path();
        let backup = self.backup_path();

        let had_install = store.is_dir(&main);
        if had_install {
            if store.is_dir(&backup) {
                storage::rmtree(store, &backup).map_err(|source| SwapError {
                    phase: InstallPhase::OldRemoved,
                    rolled_back: true,
                    source,
                })?;
            }
            store.rename(&main, &backup).map_err(|source| SwapError {
                phase: InstallPhase::OldRemoved,
                rolled_back: true,
                source,
            })?;
        }
        self.enter(InstallPhase::OldRemoved);

        if let Err(source) = store.rename(&staging, &main) {
            let rolled_back = !had_install || store.rename(&backup, &main).is_ok();
            log::error!(
                "ota: moving '{}' into place failed, rolled back: {}",
                staging,
                rolled_back
            );
            return Err(SwapError {
                phase: InstallPhase::Installed,
                rolled_back,
                source,
            });
        }

        if had_install {
            if let Err(e) = storage::rmtree(store, &backup) {
                log::warn!("ota: could not remove backup '{}': {}", backup, e);
            }
        }
        Ok(())
    }

    /// Non-bootable window between removing `main` and finishing the copy.
    fn swap_by_copy(&self) -> Result<(), SwapError> {
        let store = self.storage.as_ref();
        let main = self.main_path();
        let staging = self.staging_path();

        if store.is_dir(&main) {
            storage::rmtree(store, &main).map_err(|source| SwapError {
                phase: InstallPhase::OldRemoved,
                rolled_back: false,
                source,
            })?;
        }
        self.enter(InstallPhase::OldRemoved);

        storage::copy_dir(store, &staging, &main).map_err(|source| SwapError {
            phase: InstallPhase::Installed,
            rolled_back: false,
            source,
        })?;
        if let Err(e) = storage::rmtree(store, &staging) {
            // the next successful check removes it
            log::warn!("ota: could not remove '{}': {}", staging, e);
        }
        Ok(())
    }
}

impl<T: HttpTransport> UpdateCheck for UpdateInstaller<T> {
    fn check_for_update(&self) -> bool {
        UpdateInstaller::check_for_update(self)
    }
}

fn hash_file(storage: &dyn Storage, path: &str) -> Result<String, StorageError> {
    let mut reader = storage.open_read(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; COPY_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| StorageError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeTransport, MemStorage, RecordingTelemetry};
    use crate::fetcher::RepoConfig;

    const RELEASE: &str = "https://api.github.com/repos/owner/home/releases/latest";
    const ROOT_LISTING: &str =
        "https://api.github.com/repos/owner/home/contents/main?ref=refs/tags/v1.1.0";
    const LIB_LISTING: &str =
        "https://api.github.com/repos/owner/home/contents/main/lib?ref=refs/tags/v1.1.0";

    struct Rig {
        transport: FakeTransport,
        storage: Arc<MemStorage>,
        telemetry: Arc<RecordingTelemetry>,
        installer: UpdateInstaller<FakeTransport>,
    }

    fn rig(rename_supported: bool) -> Rig {
        let transport = FakeTransport::new();
        let storage = Arc::new(MemStorage::new());
        storage.set_rename_supported(rename_supported);
        storage.add_file("main/.version", "v1.0.0");
        storage.add_file("main/main.py", "print('old')");
        storage.add_file("main/secrets.json", "{\"key\":\"k\"}");
        let telemetry = Arc::new(RecordingTelemetry::new());

        let config = InstallerConfig {
            secret_files: vec!["secrets.json".to_string()],
            ..Default::default()
        };
        let installer = UpdateInstaller::new(
            RemoteArtifactFetcher::new(transport.clone(), RepoConfig::new("owner/home", "main")),
            storage.clone(),
            telemetry.clone(),
            config,
        );
        Rig {
            transport,
            storage,
            telemetry,
            installer,
        }
    }

    fn publish_release(transport: &FakeTransport) {
        transport.respond(RELEASE, 200, r#"{"tag_name":"v1.1.0"}"#);
        transport.respond(
            ROOT_LISTING,
            200,
            r#"[{"path":"main/lib","type":"dir","name":"lib"},
                {"path":"main/main.py","type":"file","name":"main.py","size":12}]"#,
        );
        transport.respond(
            LIB_LISTING,
            200,
            r#"[{"path":"main/lib/util.py","type":"file","name":"util.py","size":5}]"#,
        );
        transport.respond(
            "https://raw.githubusercontent.com/owner/home/v1.1.0/main/main.py",
            200,
            "print('new')",
        );
        transport.respond(
            "https://raw.githubusercontent.com/owner/home/v1.1.0/main/lib/util.py",
            200,
            "x = 1",
        );
    }

    fn assert_installed(storage: &MemStorage) {
        assert_eq!(storage.file_text("main/.version").unwrap(), "v1.1.0");
        assert_eq!(storage.file_text("main/main.py").unwrap(), "print('new')");
        assert_eq!(storage.file_text("main/lib/util.py").unwrap(), "x = 1");
        assert_eq!(
            storage.file_text("main/secrets.json").unwrap(),
            "{\"key\":\"k\"}"
        );
        assert!(!storage.exists("next"));
        assert!(!storage.exists("main.bak"));
    }

    #[test]
    fn test_check_writes_staging_marker() {
        let r = rig(true);
        r.transport.respond(RELEASE, 200, r#"{"tag_name":"v1.1.0"}"#);

        assert!(r.installer.check_for_update());
        assert_eq!(r.storage.file_text("next/.version").unwrap(), "v1.1.0");
        assert_eq!(r.installer.phase(), InstallPhase::MarkerWritten);
    }

    #[test]
    fn test_check_failures_mean_no_update() {
        let r = rig(true);
        assert!(!r.installer.check_for_update());

        r.transport.respond(RELEASE, 200, "not json");
        assert!(!r.installer.check_for_update());

        r.transport.respond(RELEASE, 200, r#"{"tag_name":"v1.0.0"}"#);
        assert!(!r.installer.check_for_update());
        assert!(!r.storage.exists("next"));
    }

    #[test]
    fn test_check_removes_stale_staging_tree() {
        let r = rig(true);
        r.storage.add_file("next/.version", "v0.9.0");
        r.storage.add_file("next/main.py", "partial");
        r.transport.respond(RELEASE, 200, r#"{"tag_name":"v1.0.0"}"#);

        assert!(!r.installer.check_for_update());
        assert!(!r.storage.exists("next"));
    }

    #[test]
    fn test_install_with_rename_support() {
        let r = rig(true);
        publish_release(&r.transport);

        assert!(r.installer.install_if_available().unwrap());
        assert_installed(&r.storage);
        assert_eq!(r.installer.phase(), InstallPhase::Notified);

        let events = r.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "ota_update");
        assert_eq!(events[0].1["version"], "v1.1.0");
        // probe leaves nothing behind
        assert!(!r.storage.exists("otaUpdater"));
        assert!(!r.storage.exists("otaUpdated"));
    }

    #[test]
    fn test_install_without_rename_falls_back_to_copy() {
        let r = rig(false);
        publish_release(&r.transport);

        assert!(r.installer.install_if_available().unwrap());
        assert_installed(&r.storage);
    }

    #[test]
    fn test_second_install_is_a_no_op() {
        let r = rig(true);
        publish_release(&r.transport);
        assert!(r.installer.install_if_available().unwrap());
        let before = r.storage.snapshot("main");

        assert!(!r.installer.install_if_available().unwrap());
        assert_eq!(r.storage.snapshot("main"), before);
        assert_eq!(r.telemetry.events().len(), 1);
    }

    #[test]
    fn test_truncated_download_leaves_install_untouched() {
        let r = rig(true);
        publish_release(&r.transport);
        r.transport.respond(
            "https://raw.githubusercontent.com/owner/home/v1.1.0/main/main.py",
            200,
            "print(",
        );
        let before = r.storage.snapshot("main");

        assert!(!r.installer.install_if_available().unwrap());
        assert_eq!(r.storage.snapshot("main"), before);
        assert!(r.telemetry.events().is_empty());
    }

    #[test]
    fn test_listing_entry_outside_tree_is_rejected() {
        let r = rig(true);
        publish_release(&r.transport);
        r.transport.respond(
            ROOT_LISTING,
            200,
            r#"[{"path":"main/../boot.py","type":"file","name":"boot.py","size":4}]"#,
        );
        r.transport.respond(
            "https://raw.githubusercontent.com/owner/home/v1.1.0/main/../boot.py",
            200,
            "evil",
        );
        let before = r.storage.snapshot("main");

        assert!(!r.installer.install_if_available().unwrap());
        assert_eq!(r.storage.snapshot("main"), before);
        assert!(!r.storage.exists("boot.py"));
        assert!(!r.storage.exists("next/../boot.py"));
        assert!(r.telemetry.events().is_empty());
    }

    #[test]
    fn test_listing_failure_leaves_install_untouched() {
        let r = rig(true);
        publish_release(&r.transport);
        r.transport.fail(LIB_LISTING);
        let before = r.storage.snapshot("main");

        assert!(!r.installer.install_if_available().unwrap());
        assert_eq!(r.storage.snapshot("main"), before);
    }

    #[test]
    fn test_failed_rename_into_place_rolls_back() {
        let r = rig(true);
        publish_release(&r.transport);
        r.storage.fail_rename_from("next");
        let before = r.storage.snapshot("main");

        let err = r.installer.install_if_available().unwrap_err();
        assert!(err.rolled_back);
        assert_eq!(err.phase, InstallPhase::Installed);
        assert_eq!(r.storage.snapshot("main"), before);
        assert!(!r.storage.exists("main.bak"));
        // staging stays for inspection / retry
        assert_eq!(r.storage.file_text("next/.version").unwrap(), "v1.1.0");
    }

    struct ScriptedLink {
        connects: bool,
        calls: usize,
    }

    impl StationLink for ScriptedLink {
        fn connect_station(&mut self, _ssid: &str, _password: &str) -> bool {
            self.calls += 1;
            self.connects
        }
    }

    #[test]
    fn test_after_boot_without_marker_skips_radio() {
        let r = rig(true);
        let mut link = ScriptedLink {
            connects: true,
            calls: 0,
        };
        assert!(!r
            .installer
            .install_after_boot_if_staged(&mut link, "Home", "pw")
            .unwrap());
        assert_eq!(link.calls, 0);
        assert!(r.transport.requests().is_empty());
    }

    #[test]
    fn test_after_boot_installs_staged_update() {
        let r = rig(true);
        publish_release(&r.transport);
        r.storage.add_file("next/.version", "v1.1.0");
        let mut link = ScriptedLink {
            connects: true,
            calls: 0,
        };

        assert!(r
            .installer
            .install_after_boot_if_staged(&mut link, "Home", "pw")
            .unwrap());
        assert_eq!(link.calls, 1);
        assert_installed(&r.storage);
    }

    #[test]
    fn test_after_boot_keeps_marker_when_offline() {
        let r = rig(true);
        r.storage.add_file("next/.version", "v1.1.0");
        let mut link = ScriptedLink {
            connects: false,
            calls: 0,
        };

        assert!(!r
            .installer
            .install_after_boot_if_staged(&mut link, "Home", "pw")
            .unwrap());
        assert!(r.storage.exists("next/.version"));
        assert!(r.transport.requests().is_empty());
    }
}
