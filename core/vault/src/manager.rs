//! Vault manager: create, unlock, read, write, re-key and lock vaults.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use lockbox_common::{Clock, Error, Result, SessionId, VaultId};
use lockbox_crypto::keyfile::{combine, keyfile_hash};
use lockbox_crypto::{constant_time_eq, AeadEngine, KdfParams, SecureMemory, VaultKeyData};
use lockbox_storage::StorageProvider;

use crate::body::{BodyStats, VaultBody, VaultEntry};
use crate::calibration::load_or_calibrate;
use crate::file::{file_name_for, VaultFile};
use crate::header::{read_header, VaultFileHeader, HEADER_LEN};
use crate::registry::{VaultRegistry, VaultRegistryEntry};
use crate::session::{SessionInfo, SessionPayload, SessionState, SessionStore, SweeperHandle};
use crate::settings::Settings;

/// Lifecycle state of one vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Locked,
    /// A password is being checked.
    Unlocking,
    Unlocked,
    /// The last session ran out; the vault is locked again.
    Expired,
}

// Lock state must survive a panicking holder.
fn lock_std<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn kdf_input(password: &[u8], keyfile: Option<&[u8]>) -> Result<Zeroizing<Vec<u8>>> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password must not be empty".to_string()));
    }
    Ok(match keyfile {
        Some(keyfile) => combine(password, keyfile),
        None => Zeroizing::new(password.to_vec()),
    })
}

/// Run KDF work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::KeyDerivation(format!("derivation task failed: {}", e)))?
}

struct UnlockingGuard<'a> {
    unlocking: &'a StdMutex<HashSet<VaultId>>,
    vault_id: VaultId,
}

impl<'a> UnlockingGuard<'a> {
    fn new(unlocking: &'a StdMutex<HashSet<VaultId>>, vault_id: VaultId) -> Self {
        lock_std(unlocking).insert(vault_id);
        Self { unlocking, vault_id }
    }
}

impl Drop for UnlockingGuard<'_> {
    fn drop(&mut self) {
        lock_std(self.unlocking).remove(&self.vault_id);
    }
}

/// Entry point for every vault operation.
///
/// Owns the session store, the registry and the storage locations vault
/// files live in. Unlocks and saves are serialized per vault.
pub struct VaultManager {
    settings: Settings,
    /// KDF parameters for new vaults, calibrated for this host.
    kdf_params: KdfParams,
    locations: HashMap<String, Arc<dyn StorageProvider>>,
    default_location: String,
    registry: Mutex<VaultRegistry>,
    store: SessionStore,
    vault_locks: StdMutex<HashMap<VaultId, Arc<Mutex<()>>>>,
    unlocking: StdMutex<HashSet<VaultId>>,
    backgrounded_at: StdMutex<Option<i64>>,
    sweeper: StdMutex<Option<SweeperHandle>>,
}

impl VaultManager {
    /// Open a manager over `locations`, the first of which is the default
    /// for new vaults.
    ///
    /// Initializes the crypto layer, calibrates the KDF on first run, loads
    /// the registry (rebuilding it when it is empty) and starts the session
    /// sweeper. Calibration is stored beside the registry.
    ///
    /// A fresh process has no sessions, so any vault the registry still
    /// flags as loaded (left over from an emergency lock or a crash) is
    /// reset and the registry saved.
    ///
    /// # Errors
    /// - `Config` if settings are invalid
    /// - `CryptoInit` if the crypto self-test failed
    /// - `InvalidKdfParams` / `KeyDerivation` if calibration fails
    /// - `InvalidInput` if no storage location is given
    pub async fn open(
        settings: Settings,
        clock: Arc<dyn Clock>,
        registry_provider: Arc<dyn StorageProvider>,
        locations: Vec<(String, Arc<dyn StorageProvider>)>,
    ) -> Result<Self> {
        settings.validate()?;
        lockbox_crypto::init()?;

        let default_location = locations
            .first()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Error::InvalidInput("At least one storage location is required".to_string()))?;
        let locations: HashMap<_, _> = locations.into_iter().collect();

        let kdf_params = load_or_calibrate(&registry_provider, &settings).await?;

        let mut registry = VaultRegistry::load(registry_provider).await?;
        if registry.list().is_empty() {
            if registry.rebuild(&locations, &[]).await? > 0 {
                registry.save().await?;
            }
        } else if registry.clear_loaded() > 0 {
            debug!("Cleared stale loaded flags");
            if let Err(e) = registry.save().await {
                warn!("Failed to save registry: {}", e);
            }
        }

        let store = SessionStore::new(clock, SecureMemory::new());
        let sweeper = store.spawn_sweeper(settings.sweep_interval());

        Ok(Self {
            settings,
            kdf_params,
            locations,
            default_location,
            registry: Mutex::new(registry),
            store,
            vault_locks: StdMutex::new(HashMap::new()),
            unlocking: StdMutex::new(HashSet::new()),
            backgrounded_at: StdMutex::new(None),
            sweeper: StdMutex::new(Some(sweeper)),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// KDF parameters new vaults are created with.
    pub fn kdf_params(&self) -> &KdfParams {
        &self.kdf_params
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.store
    }

    /// Allocator holding every session secret.
    pub fn memory(&self) -> &SecureMemory {
        self.store.memory()
    }

    fn now(&self) -> i64 {
        self.store.clock().now_millis()
    }

    fn vault_lock(&self, vault_id: &VaultId) -> Arc<Mutex<()>> {
        lock_std(&self.vault_locks)
            .entry(*vault_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn provider(&self, location: &str) -> Result<Arc<dyn StorageProvider>> {
        self.locations
            .get(location)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("Unknown storage location '{}'", location)))
    }

    /// Find the provider and file name for a vault.
    async fn locate(&self, vault_id: &VaultId) -> Result<(Arc<dyn StorageProvider>, String)> {
        let registered = {
            let registry = self.registry.lock().await;
            registry
                .get(vault_id)
                .map(|e| (e.storage_strategy.clone(), e.file_path.clone()))
        };
        if let Some((location, file_path)) = registered {
            return Ok((self.provider(&location)?, file_path));
        }

        // Not in the registry; the file alone is enough.
        let file_name = file_name_for(vault_id);
        for provider in self.locations.values() {
            if provider.exists(&file_name).await? {
                return Ok((provider.clone(), file_name));
            }
        }
        Err(Error::NotFound(format!("Vault not found: {}", vault_id)))
    }

    async fn load_file(&self, vault_id: &VaultId) -> Result<(Arc<dyn StorageProvider>, String, VaultFile)> {
        let (provider, file_name) = self.locate(vault_id).await?;
        let file = VaultFile::from_bytes(&provider.read(&file_name).await?)?;
        if file.header.vault_id != *vault_id {
            return Err(Error::HeaderInvalid(format!(
                "{} holds vault {}, expected {}",
                file_name, file.header.vault_id, vault_id
            )));
        }
        Ok((provider, file_name, file))
    }

    async fn record_save(&self, vault_id: &VaultId, file_size: u64, stats: BodyStats) {
        let mut registry = self.registry.lock().await;
        if let Err(e) = registry.update_statistics(vault_id, file_size, stats) {
            warn!("Registry not updated for vault {}: {}", vault_id, e);
            return;
        }
        if let Err(e) = registry.save().await {
            warn!("Failed to save registry: {}", e);
        }
    }

    async fn record_loaded(&self, vault_ids: &[VaultId], loaded: bool) {
        let mut registry = self.registry.lock().await;
        for vault_id in vault_ids {
            // Vaults opened straight from their file may be unregistered.
            let _ = registry.mark_loaded(vault_id, loaded);
        }
        if let Err(e) = registry.save().await {
            warn!("Failed to save registry: {}", e);
        }
    }

    fn new_session(&self, vault_id: VaultId, key: &[u8], body: &[u8], name: Option<String>) -> SessionState {
        let memory = self.store.memory();
        let payload = SessionPayload::new(memory.copy_from(key), memory.copy_from(body));
        let mut state = SessionState::new(
            vault_id,
            payload,
            self.settings.session_ttl_millis(),
            self.now(),
        );
        if let Some(name) = name {
            state.attributes.insert("name".to_string(), name);
        }
        state
    }

    /// Create a new, empty vault and return an unlocked session for it.
    ///
    /// # Preconditions
    /// - `password` must not be empty
    ///
    /// # Postconditions
    /// - The vault file is written to `location` (or the default location)
    /// - The vault is registered and its session is active
    ///
    /// # Errors
    /// - `InvalidInput` for an empty password
    /// - Storage failures
    pub async fn create_vault(
        &self,
        name: &str,
        password: &[u8],
        keyfile: Option<&[u8]>,
        location: Option<&str>,
    ) -> Result<SessionInfo> {
        let location = location.unwrap_or(&self.default_location).to_string();
        let provider = self.provider(&location)?;
        let input = kdf_input(password, keyfile)?;

        let kdf_params = self.kdf_params.clone();
        let algorithm = self.settings.default_algorithm;
        let (key_data, key) =
            run_blocking(move || VaultKeyData::create(&input, kdf_params, algorithm)).await?;

        let vault_id = VaultId::generate();
        let now = self.now();
        let mut header = VaultFileHeader::new(vault_id, &key_data.salt, now)?;
        header.set_key_file_hash(keyfile.map(keyfile_hash));

        let body = VaultBody::new();
        let plaintext = Zeroizing::new(body.to_bytes()?);
        let payload = AeadEngine::new(key_data.algorithm)?.encrypt(&plaintext, key.as_bytes())?;
        header.seal_body(&plaintext, now);

        let file_name = file_name_for(&vault_id);
        let file = VaultFile {
            header,
            key_data,
            payload,
        };
        let meta = provider.write(&file_name, file.to_bytes()?).await?;
        info!("Created vault {} in {}", vault_id, location);

        {
            let mut registry = self.registry.lock().await;
            let mut entry = VaultRegistryEntry::new(vault_id, name, &file_name, &location);
            entry.file_size = meta.size;
            entry.is_loaded = true;
            registry.upsert(entry);
            if let Err(e) = registry.save().await {
                warn!("Failed to save registry: {}", e);
            }
        }

        let state = self.new_session(vault_id, key.as_bytes(), &plaintext, Some(name.to_string()));
        Ok(self.store.write(state).await)
    }

    /// Unlock a vault.
    ///
    /// Only one unlock runs per vault at a time. Unlocking a vault that is
    /// already unlocked checks the password and returns the existing
    /// session.
    ///
    /// # Errors
    /// - `HeaderInvalid` for a foreign or unsupported file (before any KDF work)
    /// - `WrongPassword` for a wrong password or key file; no session is created
    /// - `DecryptionFailed` / `ChecksumMismatch` for a damaged body
    pub async fn unlock(
        &self,
        vault_id: &VaultId,
        password: &[u8],
        keyfile: Option<&[u8]>,
    ) -> Result<SessionInfo> {
        // Unknown ids fail here, before a per-vault lock is allocated.
        self.locate(vault_id).await?;
        let vault_lock = self.vault_lock(vault_id);
        let _serialized = vault_lock.lock().await;
        let _unlocking = UnlockingGuard::new(&self.unlocking, *vault_id);

        let (provider, file_name, mut file) = self.load_file(vault_id).await?;

        match (&file.header.key_file_hash, keyfile) {
            (Some(expected), Some(keyfile)) => {
                if !constant_time_eq(expected, &keyfile_hash(keyfile)) {
                    warn!("Wrong key file for vault {}", vault_id);
                    return Err(Error::WrongPassword);
                }
            }
            (Some(_), None) => {
                warn!("Key file missing for vault {}", vault_id);
                return Err(Error::WrongPassword);
            }
            (None, Some(_)) => {
                return Err(Error::InvalidInput(
                    "Vault does not use a key file".to_string(),
                ));
            }
            (None, None) => {}
        }

        let input = kdf_input(password, keyfile)?;
        let key_data = file.key_data.clone();
        let verification = run_blocking(move || key_data.verify(&input)).await?;
        let key = match verification.into_key() {
            Some(key) => key,
            None => {
                warn!("Wrong password for vault {}", vault_id);
                return Err(Error::WrongPassword);
            }
        };

        let plaintext = AeadEngine::new(file.key_data.algorithm)?.decrypt(&file.payload, key.as_bytes())?;
        file.header.verify_checksum(&plaintext)?;
        VaultBody::from_bytes(&plaintext)?;

        if file.key_data.upgrade_verifier(&key)? {
            match provider.write(&file_name, file.to_bytes()?).await {
                Ok(_) => info!("Upgraded legacy verifier for vault {}", vault_id),
                Err(e) => warn!("Legacy verifier upgrade not saved for vault {}: {}", vault_id, e),
            }
        }

        if let Some(existing) = self.store.session_for_vault(vault_id).await {
            debug!("Vault {} already unlocked", vault_id);
            return self.store.read(&existing.session_id).await;
        }

        let name = self.registry.lock().await.get(vault_id).map(|e| e.name.clone());
        let state = self.new_session(*vault_id, key.as_bytes(), &plaintext, name);
        let info = self.store.write(state).await;
        self.record_loaded(&[*vault_id], true).await;
        info!("Unlocked vault {}", vault_id);
        Ok(info)
    }

    /// Lock a vault, wiping its session. Returns whether it was unlocked.
    ///
    /// Registry bookkeeping failures are logged and never stop the lock.
    pub async fn lock(&self, vault_id: &VaultId) -> bool {
        let removed = self.store.remove_vault(vault_id).await;
        if removed {
            info!("Locked vault {}", vault_id);
        }
        self.record_loaded(&[*vault_id], false).await;
        removed
    }

    /// Lock every vault. Returns how many were unlocked.
    pub async fn lock_all(&self) -> usize {
        let ids: Vec<VaultId> = {
            let registry = self.registry.lock().await;
            registry.list().iter().map(|e| e.vault_id).collect()
        };
        let count = self.store.clear().await;
        self.record_loaded(&ids, false).await;
        info!("Locked {} vaults", count);
        count
    }

    /// Lock everything without awaiting.
    ///
    /// For crash handlers, suspension hooks and `Drop`. When the session
    /// store is busy, every tracked secret buffer is wiped in place instead
    /// and the store discards its sessions on next use. Returns the number
    /// of sessions dropped or buffers wiped.
    ///
    /// Loaded flags are cleared in the in-memory registry only; saving needs
    /// storage I/O. The next [`open`](Self::open) clears any stale flags on
    /// disk.
    pub fn emergency_lock_all(&self) -> usize {
        let count = match self.store.try_clear() {
            Some(count) => count,
            None => {
                let wiped = self.store.memory().wipe_all();
                self.store.mark_emergency_wiped();
                error!("Session store busy during emergency lock; wiped {} buffers", wiped);
                wiped
            }
        };

        if let Ok(mut registry) = self.registry.try_lock() {
            registry.clear_loaded();
        }
        if count > 0 {
            warn!("Emergency lock cleared {} secrets", count);
        }
        count
    }

    /// The app moved to the background at `now` (epoch ms).
    ///
    /// With a zero threshold every vault locks immediately. Otherwise the
    /// session store drops every session once the threshold has passed,
    /// enforced by the sweep and by every read, whether or not the app
    /// comes back. Returns how many vaults were locked now.
    pub async fn on_backgrounded(&self, now: i64) -> usize {
        *lock_std(&self.backgrounded_at) = Some(now);
        let threshold = self.settings.background_lock_threshold_ms;
        if threshold == 0 {
            return self.lock_all().await;
        }
        self.store.lock_at(now.saturating_add(threshold as i64)).await;
        0
    }

    /// The app returned to the foreground at `now` (epoch ms).
    ///
    /// Cancels the pending background lock. Locks every vault if it was
    /// away for at least the threshold.
    pub async fn on_foregrounded(&self, now: i64) -> usize {
        self.store.cancel_lock_at().await;
        let since = lock_std(&self.backgrounded_at).take();
        match since {
            Some(since) if now - since >= self.settings.background_lock_threshold_ms as i64 => {
                debug!("Backgrounded for {} ms", now - since);
                self.lock_all().await
            }
            _ => 0,
        }
    }

    pub async fn state(&self, vault_id: &VaultId) -> VaultState {
        if lock_std(&self.unlocking).contains(vault_id) {
            return VaultState::Unlocking;
        }
        if self.store.session_for_vault(vault_id).await.is_some() {
            return VaultState::Unlocked;
        }
        if self.store.was_expired(vault_id).await {
            return VaultState::Expired;
        }
        VaultState::Locked
    }

    /// Session details, refreshing its TTL.
    pub async fn session(&self, session_id: &SessionId) -> Result<SessionInfo> {
        self.store.read(session_id).await
    }

    /// The live session of an unlocked vault, refreshing its TTL.
    ///
    /// # Errors
    /// - `VaultLocked` if the vault has no live session
    pub async fn session_for_vault(&self, vault_id: &VaultId) -> Result<SessionInfo> {
        match self.store.session_for_vault(vault_id).await {
            Some(session) => self.store.read(&session.session_id).await,
            None => Err(Error::VaultLocked(vault_id.to_string())),
        }
    }

    /// Decrypted body of an unlocked vault.
    pub async fn read_body(&self, session_id: &SessionId) -> Result<VaultBody> {
        self.store
            .with_payload(session_id, |payload| {
                payload.body().expose(VaultBody::from_bytes)
            })
            .await
    }

    pub async fn read_entries(&self, session_id: &SessionId) -> Result<Vec<VaultEntry>> {
        Ok(self.read_body(session_id).await?.entries.clone())
    }

    /// Replace all entries and save.
    pub async fn write_entries(&self, session_id: &SessionId, entries: Vec<VaultEntry>) -> Result<()> {
        self.mutate_body(session_id, move |body| {
            body.entries.clear();
            for entry in entries {
                body.upsert(entry);
            }
            Ok(())
        })
        .await
    }

    /// Insert or replace one entry and save. Returns the entry id.
    pub async fn upsert_entry(&self, session_id: &SessionId, entry: VaultEntry) -> Result<String> {
        let id = entry.id.clone();
        self.mutate_body(session_id, move |body| {
            body.upsert(entry);
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn delete_entry(&self, session_id: &SessionId, entry_id: &str) -> Result<()> {
        self.mutate_body(session_id, |body| body.remove(entry_id)).await
    }

    /// Apply `f` to the body, re-encrypt under a fresh nonce and save.
    ///
    /// The session copy is only replaced once the file is written.
    async fn mutate_body<R>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut VaultBody) -> Result<R>,
    ) -> Result<R> {
        let vault_id = self.store.read(session_id).await?.vault_id;
        let vault_lock = self.vault_lock(&vault_id);
        let _serialized = vault_lock.lock().await;

        let (key, mut body) = self
            .store
            .with_payload(session_id, |payload| {
                let key = Zeroizing::new(payload.key().expose(|k| k.to_vec()));
                let body = payload.body().expose(VaultBody::from_bytes)?;
                Ok((key, body))
            })
            .await?;

        let result = f(&mut body)?;
        let plaintext = Zeroizing::new(body.to_bytes()?);

        let (provider, file_name, mut file) = self.load_file(&vault_id).await?;
        file.payload = AeadEngine::new(file.key_data.algorithm)?.encrypt(&plaintext, &key)?;
        file.header.seal_body(&plaintext, self.now());
        let meta = provider.write(&file_name, file.to_bytes()?).await?;
        debug!("Saved vault {} ({} bytes)", vault_id, meta.size);

        let memory = self.store.memory().clone();
        self.store
            .with_payload(session_id, |payload| {
                payload.replace_body(memory.copy_from(&plaintext));
                Ok(())
            })
            .await?;
        self.record_save(&vault_id, meta.size, body.stats()).await;
        Ok(result)
    }

    /// Change the master password of a vault.
    ///
    /// A new salt and key are derived, the body is re-encrypted and a new
    /// verifier generated. The file is replaced in one atomic write; until
    /// that write succeeds the old password keeps working. An unlocked
    /// session switches to the new key afterwards.
    ///
    /// # Errors
    /// - `WrongPassword` if `current` is wrong
    /// - Storage failures, in which case nothing changed
    pub async fn change_master_password(
        &self,
        vault_id: &VaultId,
        current: &[u8],
        new: &[u8],
        keyfile: Option<&[u8]>,
    ) -> Result<()> {
        self.locate(vault_id).await?;
        let vault_lock = self.vault_lock(vault_id);
        let _serialized = vault_lock.lock().await;

        let (provider, file_name, mut file) = self.load_file(vault_id).await?;
        if file.header.has_key_file() != keyfile.is_some() {
            warn!("Key file mismatch changing password for vault {}", vault_id);
            return Err(Error::WrongPassword);
        }

        let current_input = kdf_input(current, keyfile)?;
        let new_input = kdf_input(new, keyfile)?;
        let old_data = file.key_data.clone();
        let kdf_params = file.key_data.kdf_params.clone();
        let algorithm = file.key_data.algorithm;

        let derived = run_blocking(move || {
            let old_key = match old_data.verify(&current_input)?.into_key() {
                Some(key) => key,
                None => return Ok(None),
            };
            let (new_data, new_key) = VaultKeyData::create(&new_input, kdf_params, algorithm)?;
            Ok(Some((old_key, new_data, new_key)))
        })
        .await?;

        let (old_key, new_data, new_key) = match derived {
            Some(derived) => derived,
            None => {
                warn!("Wrong password for vault {}", vault_id);
                return Err(Error::WrongPassword);
            }
        };

        let engine = AeadEngine::new(algorithm)?;
        let plaintext = engine.decrypt(&file.payload, old_key.as_bytes())?;
        file.header.verify_checksum(&plaintext)?;

        file.payload = engine.encrypt(&plaintext, new_key.as_bytes())?;
        file.header.set_salt(&new_data.salt)?;
        file.header.seal_body(&plaintext, self.now());
        file.key_data = new_data;

        provider.write(&file_name, file.to_bytes()?).await?;
        info!("Master password changed for vault {}", vault_id);

        if let Some(session) = self.store.session_for_vault(vault_id).await {
            let memory = self.store.memory().clone();
            self.store
                .with_payload(&session.session_id, |payload| {
                    payload.replace_key(memory.copy_from(new_key.as_bytes()));
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Read a vault's header without the password.
    pub async fn vault_info(&self, vault_id: &VaultId) -> Result<VaultFileHeader> {
        let (provider, file_name) = self.locate(vault_id).await?;
        read_header(&provider.read_prefix(&file_name, HEADER_LEN).await?)
    }

    pub async fn list_vaults(&self) -> Vec<VaultRegistryEntry> {
        self.registry.lock().await.list().to_vec()
    }

    pub async fn set_default_vault(&self, vault_id: &VaultId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.set_default(vault_id)?;
        registry.save().await
    }

    /// Re-scan every storage location and rewrite the registry.
    pub async fn rebuild_registry(&self) -> Result<usize> {
        let loaded = self.store.live_vaults().await;
        let mut registry = self.registry.lock().await;
        let count = registry.rebuild(&self.locations, &loaded).await?;
        registry.save().await?;
        Ok(count)
    }

    /// Stop the sweeper and lock every vault.
    pub async fn shutdown(&self) {
        let sweeper = lock_std(&self.sweeper).take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
        self.lock_all().await;
    }
}

impl Drop for VaultManager {
    fn drop(&mut self) {
        // Dropping the handle stops the sweep task, which holds a store clone.
        lock_std(&self.sweeper).take();
        self.emergency_lock_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_common::ManualClock;
    use lockbox_crypto::verifier::{legacy_verifier, VerifierFormat};
    use lockbox_crypto::KdfParams;
    use lockbox_storage::MemoryProvider;

    const PASSWORD: &[u8] = b"Tr0ub4dor&3";

    fn settings() -> Settings {
        Settings {
            default_kdf: KdfParams::argon2id(1024, 1, 1, 32).unwrap(),
            calibration_target_ms: 0,
            ..Settings::default()
        }
    }

    struct Fixture {
        manager: VaultManager,
        clock: ManualClock,
        storage: MemoryProvider,
    }

    async fn fixture_with(settings: Settings) -> Fixture {
        let clock = ManualClock::new(1_700_000_000_000);
        let storage = MemoryProvider::new();
        let manager = VaultManager::open(
            settings,
            Arc::new(clock.clone()),
            Arc::new(MemoryProvider::new()),
            vec![("local".to_string(), Arc::new(storage.clone()) as Arc<dyn StorageProvider>)],
        )
        .await
        .unwrap();
        Fixture {
            manager,
            clock,
            storage,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(settings()).await
    }

    #[tokio::test]
    async fn test_create_write_lock_unlock() {
        let f = fixture().await;
        let session = f.manager.create_vault("personal", PASSWORD, None, None).await.unwrap();
        let vault_id = session.vault_id;

        let entry = VaultEntry::new("demo", "p@ss");
        f.manager.upsert_entry(&session.session_id, entry.clone()).await.unwrap();

        assert!(f.manager.lock(&vault_id).await);
        assert_eq!(f.manager.state(&vault_id).await, VaultState::Locked);
        assert!(matches!(
            f.manager.session_for_vault(&vault_id).await,
            Err(Error::VaultLocked(_))
        ));
        assert!(f.manager.read_entries(&session.session_id).await.is_err());

        let session = f.manager.unlock(&vault_id, PASSWORD, None).await.unwrap();
        let entries = f.manager.read_entries(&session.session_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "demo");
        assert_eq!(entries[0].password, "p@ss");
        assert_eq!(entries[0].id, entry.id);
    }

    #[tokio::test]
    async fn test_wrong_password_creates_no_session() {
        let f = fixture().await;
        let vault_id = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;
        f.manager.lock(&vault_id).await;

        let result = f.manager.unlock(&vault_id, b"wrong", None).await;
        assert!(matches!(result, Err(Error::WrongPassword)));
        assert_eq!(f.manager.state(&vault_id).await, VaultState::Locked);
        assert!(f.manager.sessions().is_empty().await);
        assert_eq!(f.manager.memory().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_unlock_while_unlocked_returns_same_session() {
        let f = fixture().await;
        let created = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap();
        let again = f.manager.unlock(&created.vault_id, PASSWORD, None).await.unwrap();
        assert_eq!(again.session_id, created.session_id);
        assert!(f.manager.unlock(&created.vault_id, b"nope", None).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_unlocks_share_one_session() {
        let f = fixture().await;
        let vault_id = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;
        f.manager.lock(&vault_id).await;

        let (a, b) = tokio::join!(
            f.manager.unlock(&vault_id, PASSWORD, None),
            f.manager.unlock(&vault_id, PASSWORD, None)
        );
        assert_eq!(a.unwrap().session_id, b.unwrap().session_id);
        assert_eq!(f.manager.sessions().len().await, 1);
    }

    #[tokio::test]
    async fn test_session_expiry_state() {
        let f = fixture().await;
        let session = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap();
        assert_eq!(f.manager.state(&session.vault_id).await, VaultState::Unlocked);

        f.clock.advance(f.manager.settings().session_ttl_millis());
        assert!(matches!(
            f.manager.read_entries(&session.session_id).await,
            Err(Error::SessionExpired(_))
        ));
        assert_eq!(f.manager.state(&session.vault_id).await, VaultState::Expired);
    }

    #[tokio::test]
    async fn test_change_master_password() {
        let f = fixture().await;
        let session = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap();
        let vault_id = session.vault_id;
        f.manager
            .upsert_entry(&session.session_id, VaultEntry::new("demo", "p@ss"))
            .await
            .unwrap();
        let old_salt = f.manager.vault_info(&vault_id).await.unwrap().salt;

        assert!(matches!(
            f.manager.change_master_password(&vault_id, b"bad", b"n3w-pass", None).await,
            Err(Error::WrongPassword)
        ));
        f.manager
            .change_master_password(&vault_id, PASSWORD, b"n3w-pass", None)
            .await
            .unwrap();
        assert_ne!(f.manager.vault_info(&vault_id).await.unwrap().salt, old_salt);

        // The live session now writes under the new key.
        f.manager
            .upsert_entry(&session.session_id, VaultEntry::new("second", "x"))
            .await
            .unwrap();

        f.manager.lock(&vault_id).await;
        assert!(f.manager.unlock(&vault_id, PASSWORD, None).await.is_err());
        let session = f.manager.unlock(&vault_id, b"n3w-pass", None).await.unwrap();
        assert_eq!(f.manager.read_entries(&session.session_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_rekey_keeps_old_password() {
        let f = fixture().await;
        let vault_id = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;

        f.storage.set_fail_writes(true);
        assert!(f
            .manager
            .change_master_password(&vault_id, PASSWORD, b"n3w-pass", None)
            .await
            .is_err());
        f.storage.set_fail_writes(false);

        f.manager.lock(&vault_id).await;
        assert!(f.manager.unlock(&vault_id, PASSWORD, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_key_file_required() {
        let f = fixture().await;
        let keyfile = [9u8; 32];
        let vault_id = f
            .manager
            .create_vault("v", PASSWORD, Some(&keyfile), None)
            .await
            .unwrap()
            .vault_id;
        f.manager.lock(&vault_id).await;

        assert!(f.manager.vault_info(&vault_id).await.unwrap().has_key_file());
        assert!(matches!(
            f.manager.unlock(&vault_id, PASSWORD, None).await,
            Err(Error::WrongPassword)
        ));
        assert!(matches!(
            f.manager.unlock(&vault_id, PASSWORD, Some(&[8u8; 32])).await,
            Err(Error::WrongPassword)
        ));
        assert!(f.manager.unlock(&vault_id, PASSWORD, Some(&keyfile)).await.is_ok());
    }

    #[tokio::test]
    async fn test_tampered_checksum_detected() {
        let f = fixture().await;
        let vault_id = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;
        f.manager.lock(&vault_id).await;

        let name = file_name_for(&vault_id);
        let mut bytes = f.storage.read(&name).await.unwrap();
        bytes[72] ^= 0x01;
        f.storage.write(&name, bytes).await.unwrap();

        assert!(matches!(
            f.manager.unlock(&vault_id, PASSWORD, None).await,
            Err(Error::ChecksumMismatch)
        ));
        assert!(f.manager.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_foreign_file_fails_before_kdf() {
        let f = fixture().await;
        let vault_id = VaultId::generate();
        f.storage
            .write(&file_name_for(&vault_id), vec![0u8; 512])
            .await
            .unwrap();
        assert!(matches!(
            f.manager.unlock(&vault_id, PASSWORD, None).await,
            Err(Error::HeaderInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_legacy_verifier_upgraded_on_unlock() {
        let f = fixture().await;
        let vault_id = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;
        f.manager.lock(&vault_id).await;

        let name = file_name_for(&vault_id);
        let mut file = VaultFile::from_bytes(&f.storage.read(&name).await.unwrap()).unwrap();
        let key = file.key_data.derive(PASSWORD).unwrap();
        file.key_data.verifier = legacy_verifier(&key);
        f.storage.write(&name, file.to_bytes().unwrap()).await.unwrap();

        f.manager.unlock(&vault_id, PASSWORD, None).await.unwrap();
        let upgraded = VaultFile::from_bytes(&f.storage.read(&name).await.unwrap()).unwrap();
        assert_eq!(upgraded.key_data.verifier_format().unwrap(), VerifierFormat::Salted);
    }

    #[tokio::test]
    async fn test_background_lock() {
        let f = fixture_with(Settings {
            background_lock_threshold_ms: 10_000,
            ..settings()
        })
        .await;
        let vault_id = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;

        let now = f.clock.now_millis();
        assert_eq!(f.manager.on_backgrounded(now).await, 0);
        assert_eq!(f.manager.on_foregrounded(now + 5_000).await, 0);
        assert_eq!(f.manager.state(&vault_id).await, VaultState::Unlocked);

        f.manager.on_backgrounded(now).await;
        assert_eq!(f.manager.on_foregrounded(now + 10_000).await, 1);
        assert_eq!(f.manager.state(&vault_id).await, VaultState::Locked);
    }

    #[tokio::test]
    async fn test_background_lock_without_returning() {
        let f = fixture_with(Settings {
            background_lock_threshold_ms: 10_000,
            ..settings()
        })
        .await;
        let session = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap();
        f.manager
            .upsert_entry(&session.session_id, VaultEntry::new("demo", "p@ss"))
            .await
            .unwrap();

        f.manager.on_backgrounded(f.clock.now_millis()).await;
        f.clock.advance(9_999);
        assert_eq!(f.manager.state(&session.vault_id).await, VaultState::Unlocked);

        f.clock.advance(50_001);
        assert_eq!(f.manager.state(&session.vault_id).await, VaultState::Locked);
        assert!(f.manager.read_entries(&session.session_id).await.is_err());
        assert_eq!(f.manager.memory().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_locks_backgrounded_app() {
        let f = fixture_with(Settings {
            background_lock_threshold_ms: 10_000,
            sweep_interval_ms: 10,
            ..settings()
        })
        .await;
        f.manager.create_vault("v", PASSWORD, None, None).await.unwrap();

        f.manager.on_backgrounded(f.clock.now_millis()).await;
        f.clock.advance(60_000);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Nothing read the store, so the sweep did the wiping.
        assert_eq!(f.manager.sessions().len().await, 0);
        assert_eq!(f.manager.memory().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_background_lock_immediate() {
        let f = fixture().await;
        let vault_id = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;
        assert_eq!(f.manager.on_backgrounded(f.clock.now_millis()).await, 1);
        assert_eq!(f.manager.state(&vault_id).await, VaultState::Locked);
    }

    #[tokio::test]
    async fn test_emergency_lock_all() {
        let f = fixture().await;
        f.manager.create_vault("a", PASSWORD, None, None).await.unwrap();
        f.manager.create_vault("b", PASSWORD, None, None).await.unwrap();

        assert_eq!(f.manager.emergency_lock_all(), 2);
        assert!(f.manager.sessions().is_empty().await);
        assert_eq!(f.manager.memory().tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_registry_tracks_saves_and_rebuilds() {
        let f = fixture().await;
        let session = f.manager.create_vault("personal", PASSWORD, None, None).await.unwrap();
        f.manager
            .upsert_entry(&session.session_id, VaultEntry::new("demo", "p@ss"))
            .await
            .unwrap();

        let listed = f.manager.list_vaults().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].entry_count, 1);
        assert!(listed[0].is_default);
        assert!(listed[0].file_size > HEADER_LEN as u64);

        assert_eq!(f.manager.rebuild_registry().await.unwrap(), 1);
        assert_eq!(f.manager.list_vaults().await[0].name, "personal");
    }

    #[tokio::test]
    async fn test_unlock_unknown_vault_allocates_no_lock() {
        let f = fixture().await;
        for _ in 0..3 {
            let result = f.manager.unlock(&VaultId::generate(), PASSWORD, None).await;
            assert!(matches!(result, Err(Error::NotFound(_))));
        }
        let result = f
            .manager
            .change_master_password(&VaultId::generate(), PASSWORD, b"new", None)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(lock_std(&f.manager.vault_locks).is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_keeps_unlocked_vaults_loaded() {
        let f = fixture().await;
        let open = f.manager.create_vault("open", PASSWORD, None, None).await.unwrap().vault_id;
        let closed = f.manager.create_vault("closed", PASSWORD, None, None).await.unwrap().vault_id;
        f.manager.lock(&closed).await;

        assert_eq!(f.manager.rebuild_registry().await.unwrap(), 2);
        let listed = f.manager.list_vaults().await;
        let loaded = |id: VaultId| listed.iter().find(|e| e.vault_id == id).unwrap().is_loaded;
        assert!(loaded(open));
        assert!(!loaded(closed));
    }

    #[tokio::test]
    async fn test_open_clears_stale_loaded_flags() {
        let index = MemoryProvider::new();
        let storage = MemoryProvider::new();
        let open = || {
            VaultManager::open(
                settings(),
                Arc::new(ManualClock::new(1_700_000_000_000)),
                Arc::new(index.clone()),
                vec![("local".to_string(), Arc::new(storage.clone()) as Arc<dyn StorageProvider>)],
            )
        };

        let manager = open().await.unwrap();
        let vault_id = manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;
        // Dropping runs only the emergency lock, which cannot save.
        drop(manager);
        let on_disk = VaultRegistry::load(Arc::new(index.clone())).await.unwrap();
        assert!(on_disk.get(&vault_id).unwrap().is_loaded);

        let manager = open().await.unwrap();
        assert!(!manager.list_vaults().await[0].is_loaded);
        let on_disk = VaultRegistry::load(Arc::new(index.clone())).await.unwrap();
        assert!(!on_disk.get(&vault_id).unwrap().is_loaded);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_open_calibrates_once() {
        let index = MemoryProvider::new();
        let storage = MemoryProvider::new();
        let calibrated = Settings {
            calibration_target_ms: 5,
            ..settings()
        };
        let open = || {
            VaultManager::open(
                calibrated.clone(),
                Arc::new(ManualClock::new(1_700_000_000_000)),
                Arc::new(index.clone()),
                vec![("local".to_string(), Arc::new(storage.clone()) as Arc<dyn StorageProvider>)],
            )
        };

        let manager = open().await.unwrap();
        let record_bytes = index.read(crate::calibration::CALIBRATION_FILE).await.unwrap();
        let record: crate::calibration::CalibrationRecord =
            serde_json::from_slice(&record_bytes).unwrap();
        assert_eq!(manager.kdf_params(), &record.params);

        let vault_id = manager.create_vault("v", PASSWORD, None, None).await.unwrap().vault_id;
        let file = VaultFile::from_bytes(&storage.read(&file_name_for(&vault_id)).await.unwrap()).unwrap();
        assert_eq!(file.key_data.kdf_params, record.params);
        manager.shutdown().await;

        let reopened = open().await.unwrap();
        assert_eq!(reopened.kdf_params(), &record.params);
        assert_eq!(
            index.read(crate::calibration::CALIBRATION_FILE).await.unwrap(),
            record_bytes
        );
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let f = fixture().await;
        let session = f.manager.create_vault("v", PASSWORD, None, None).await.unwrap();
        let id = f
            .manager
            .upsert_entry(&session.session_id, VaultEntry::new("demo", "p@ss"))
            .await
            .unwrap();
        f.manager.delete_entry(&session.session_id, &id).await.unwrap();
        assert!(f.manager.read_entries(&session.session_id).await.unwrap().is_empty());
        assert!(f.manager.delete_entry(&session.session_id, &id).await.is_err());
    }
}
