// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Metadata store: buckets, objects and users in memory, snapshotted to
//! tab-separated files under the data root.
//!
//! `s3_meta.dat` holds buckets and objects; `user.dat` holds users together
//! with their secrets and is written with mode 0600. Both are replaced via
//! write-temp-then-rename, so a crashed snapshot leaves the previous file
//! intact. Every public operation takes the single store mutex; mutation is
//! off the hot request-read path, so one lock is enough.

use chrono::Utc;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const META_FILE: &str = "s3_meta.dat";
const USER_FILE: &str = "user.dat";

const ACCESS_KEY_LEN: usize = 20;
const SECRET_KEY_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed record in {file} line {line}")]
    Parse { file: String, line: usize },
    #[error("username contains tab or newline")]
    InvalidUsername,
    #[error("user already exists")]
    UserExists,
    #[error("snapshot failed: {0}")]
    Save(String),
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: i64,
    pub name: String,
    pub created_at: String,
    pub owner_id: String,
}

#[derive(Debug, Clone)]
pub struct ObjectRec {
    pub id: i64,
    pub bucket_id: i64,
    pub key: String,
    pub size: i64,
    pub last_modified: String,
    pub etag: String,
    pub storage_path: String,
    pub acl: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub access_key: String,
    pub created_at: String,
}

#[derive(Default)]
struct StoreInner {
    data_root: PathBuf,
    next_bucket_id: i64,
    next_object_id: i64,
    next_user_id: i64,
    buckets: Vec<Bucket>,
    objects: Vec<ObjectRec>,
    users: Vec<User>,
    secrets: HashMap<String, String>,
    last_save_error: Option<String>,
}

pub struct MetaStore {
    inner: Mutex<StoreInner>,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_iso8601() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_i64(field: &str, file: &str, line: usize) -> Result<i64, MetaError> {
    field.parse::<i64>().map_err(|_| MetaError::Parse {
        file: file.to_string(),
        line,
    })
}

impl MetaStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                next_bucket_id: 1,
                next_object_id: 1,
                next_user_id: 1,
                ..StoreInner::default()
            }),
        }
    }

    /// Read `s3_meta.dat` (buckets and objects only). A missing file means
    /// an empty store; anything else that fails is fatal to startup.
    pub fn load(&self, data_root: &Path) -> Result<(), MetaError> {
        let mut inner = self.inner.lock();
        inner.data_root = data_root.to_path_buf();
        inner.next_bucket_id = 1;
        inner.next_object_id = 1;
        inner.next_user_id = 1;
        inner.buckets.clear();
        inner.objects.clear();
        inner.users.clear();
        inner.secrets.clear();

        let path = data_root.join(META_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no metadata file, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let file = path.display().to_string();
        let mut first = true;
        for (idx, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split('\t').collect();
            let lead = std::mem::replace(&mut first, false);
            match parts[0] {
                "N" if lead && parts.len() >= 3 => {
                    inner.next_bucket_id = parse_i64(parts[1], &file, idx)?;
                    inner.next_object_id = parse_i64(parts[2], &file, idx)?;
                }
                "B" if parts.len() >= 5 => {
                    let bucket = Bucket {
                        id: parse_i64(parts[1], &file, idx)?,
                        name: parts[2].to_string(),
                        created_at: parts[3].to_string(),
                        owner_id: parts[4].to_string(),
                    };
                    inner.buckets.push(bucket);
                }
                "O" if parts.len() >= 9 => {
                    let object = ObjectRec {
                        id: parse_i64(parts[1], &file, idx)?,
                        bucket_id: parse_i64(parts[2], &file, idx)?,
                        key: parts[3].to_string(),
                        size: parse_i64(parts[4], &file, idx)?,
                        last_modified: parts[5].to_string(),
                        etag: parts[6].to_string(),
                        storage_path: parts[7].to_string(),
                        acl: parts[8].to_string(),
                    };
                    inner.objects.push(object);
                }
                _ => {
                    return Err(MetaError::Parse { file, line: idx });
                }
            }
        }
        tracing::info!(
            buckets = inner.buckets.len(),
            objects = inner.objects.len(),
            "metadata loaded"
        );
        Ok(())
    }

    /// Add the administrator account when no `root` user exists yet. Must
    /// run before [`load_user_dat`](Self::load_user_dat) so the configured
    /// credentials stay authoritative over whatever the file says.
    pub fn ensure_root_user(&self, access_key: &str, secret_key: &str) {
        if access_key.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.users.iter().any(|u| u.username == "root") {
            return;
        }
        let id = inner.next_user_id;
        inner.next_user_id += 1;
        inner.users.push(User {
            id,
            username: "root".to_string(),
            access_key: access_key.to_string(),
            created_at: now_iso8601(),
        });
        inner
            .secrets
            .insert(access_key.to_string(), secret_key.to_string());
    }

    /// Read `user.dat`. `root` lines are skipped (root is authoritative from
    /// configuration); a legacy two-field `access_key\tsecret` line is
    /// accepted and promoted to a full user.
    pub fn load_user_dat(&self) -> Result<(), MetaError> {
        let mut inner = self.inner.lock();
        let path = inner.data_root.join(USER_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let file = path.display().to_string();
        let mut first = true;
        let mut legacy_id = 1i64;
        for (idx, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split('\t').collect();
            if first && parts[0] == "N" && parts.len() >= 2 {
                let file_next = parse_i64(parts[1], &file, idx)?;
                if file_next > inner.next_user_id {
                    inner.next_user_id = file_next;
                }
                first = false;
                continue;
            }
            first = false;
            if parts[0] == "U" && parts.len() >= 6 {
                if parts[2] == "root" {
                    continue;
                }
                inner
                    .secrets
                    .insert(parts[3].to_string(), parts[4].to_string());
                let user = User {
                    id: parse_i64(parts[1], &file, idx)?,
                    username: parts[2].to_string(),
                    access_key: parts[3].to_string(),
                    created_at: parts[5].to_string(),
                };
                inner.users.push(user);
            } else if parts[0] != "N" && parts.len() >= 2 {
                // Legacy format: access_key \t secret.
                if inner.secrets.contains_key(parts[0]) {
                    continue;
                }
                inner
                    .secrets
                    .insert(parts[0].to_string(), parts[1].to_string());
                let user = User {
                    id: legacy_id,
                    username: parts[0].to_string(),
                    access_key: parts[0].to_string(),
                    created_at: String::new(),
                };
                legacy_id += 1;
                inner.users.push(user);
            }
        }
        if legacy_id > 1 && legacy_id > inner.next_user_id {
            inner.next_user_id = legacy_id;
        }
        Ok(())
    }

    /// Atomic snapshot: `s3_meta.dat.tmp` renamed over `s3_meta.dat`, then
    /// the same for `user.dat`. Rename is the durability barrier; a failed
    /// snapshot leaves the on-disk state unchanged and the caller must roll
    /// back whatever in-memory mutation preceded it.
    pub fn save(&self) -> Result<(), MetaError> {
        let mut inner = self.inner.lock();
        inner.last_save_error = None;

        let mut meta = String::new();
        meta.push_str(&format!(
            "N\t{}\t{}\n",
            inner.next_bucket_id, inner.next_object_id
        ));
        for b in &inner.buckets {
            meta.push_str(&format!(
                "B\t{}\t{}\t{}\t{}\n",
                b.id, b.name, b.created_at, b.owner_id
            ));
        }
        for o in &inner.objects {
            meta.push_str(&format!(
                "O\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                o.id, o.bucket_id, o.key, o.size, o.last_modified, o.etag, o.storage_path, o.acl
            ));
        }

        let mut users = String::new();
        users.push_str(&format!("N\t{}\n", inner.next_user_id));
        for u in &inner.users {
            if let Some(secret) = inner.secrets.get(&u.access_key) {
                users.push_str(&format!(
                    "U\t{}\t{}\t{}\t{}\t{}\n",
                    u.id, u.username, u.access_key, secret, u.created_at
                ));
            }
        }

        let meta_path = inner.data_root.join(META_FILE);
        let user_path = inner.data_root.join(USER_FILE);
        let result = write_replace(&meta_path, meta.as_bytes(), None)
            .and_then(|_| write_replace(&user_path, users.as_bytes(), Some(0o600)));
        if let Err(e) = result {
            let msg = e.to_string();
            inner.last_save_error = Some(msg.clone());
            tracing::error!(error = %msg, "metadata snapshot failed");
            return Err(MetaError::Save(msg));
        }
        Ok(())
    }

    pub fn last_save_error(&self) -> Option<String> {
        self.inner.lock().last_save_error.clone()
    }

    pub fn get_bucket_by_name_and_owner(&self, name: &str, owner_id: &str) -> Option<Bucket> {
        let inner = self.inner.lock();
        inner
            .buckets
            .iter()
            .find(|b| b.name == name && b.owner_id == owner_id)
            .cloned()
    }

    pub fn list_buckets_by_owner(&self, owner_id: &str) -> Vec<Bucket> {
        let inner = self.inner.lock();
        inner
            .buckets
            .iter()
            .filter(|b| b.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Returns the new bucket id, or `None` when `(name, owner)` exists.
    pub fn create_bucket(&self, name: &str, owner_id: &str) -> Option<i64> {
        let mut inner = self.inner.lock();
        if inner
            .buckets
            .iter()
            .any(|b| b.name == name && b.owner_id == owner_id)
        {
            return None;
        }
        let id = inner.next_bucket_id;
        inner.next_bucket_id += 1;
        inner.buckets.push(Bucket {
            id,
            name: name.to_string(),
            created_at: now_iso8601(),
            owner_id: owner_id.to_string(),
        });
        Some(id)
    }

    pub fn delete_bucket(&self, bucket_id: i64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.buckets.len();
        inner.buckets.retain(|b| b.id != bucket_id);
        inner.buckets.len() != before
    }

    /// Reinstate a bucket removed by a mutation whose snapshot failed.
    pub fn restore_bucket(&self, bucket: Bucket) {
        self.inner.lock().buckets.push(bucket);
    }

    pub fn get_object(&self, bucket_id: i64, key: &str) -> Option<ObjectRec> {
        let inner = self.inner.lock();
        inner
            .objects
            .iter()
            .find(|o| o.bucket_id == bucket_id && o.key == key)
            .cloned()
    }

    pub fn list_objects(&self, bucket_id: i64) -> Vec<ObjectRec> {
        let inner = self.inner.lock();
        inner
            .objects
            .iter()
            .filter(|o| o.bucket_id == bucket_id)
            .cloned()
            .collect()
    }

    /// Insert or overwrite by `(bucket_id, key)`. An overwrite keeps the
    /// object id.
    #[allow(clippy::too_many_arguments)]
    pub fn put_object(
        &self,
        bucket_id: i64,
        key: &str,
        size: i64,
        last_modified: &str,
        etag: &str,
        storage_path: &str,
        acl: &str,
    ) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .objects
            .iter_mut()
            .find(|o| o.bucket_id == bucket_id && o.key == key)
        {
            existing.size = size;
            existing.last_modified = last_modified.to_string();
            existing.etag = etag.to_string();
            existing.storage_path = storage_path.to_string();
            existing.acl = acl.to_string();
            return;
        }
        let id = inner.next_object_id;
        inner.next_object_id += 1;
        inner.objects.push(ObjectRec {
            id,
            bucket_id,
            key: key.to_string(),
            size,
            last_modified: last_modified.to_string(),
            etag: etag.to_string(),
            storage_path: storage_path.to_string(),
            acl: acl.to_string(),
        });
    }

    pub fn delete_object(&self, bucket_id: i64, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.objects.len();
        inner
            .objects
            .retain(|o| !(o.bucket_id == bucket_id && o.key == key));
        inner.objects.len() != before
    }

    /// Reinstate an object removed by a mutation whose snapshot failed.
    pub fn restore_object(&self, object: ObjectRec) {
        self.inner.lock().objects.push(object);
    }

    /// Create a user with generated credentials. The secret never leaves the
    /// store except through `user.dat`.
    pub fn create_user(&self, username: &str) -> Result<User, MetaError> {
        if username.contains('\t') || username.contains('\n') {
            return Err(MetaError::InvalidUsername);
        }
        let access_key = random_alnum(ACCESS_KEY_LEN);
        let secret_key = random_alnum(SECRET_KEY_LEN);

        let mut inner = self.inner.lock();
        if inner
            .users
            .iter()
            .any(|u| u.username == username || u.access_key == access_key)
        {
            return Err(MetaError::UserExists);
        }
        let id = inner.next_user_id;
        inner.next_user_id += 1;
        let user = User {
            id,
            username: username.to_string(),
            access_key: access_key.clone(),
            created_at: now_iso8601(),
        };
        inner.users.push(user.clone());
        inner.secrets.insert(access_key, secret_key);
        Ok(user)
    }

    /// Undo a `create_user` whose snapshot failed.
    pub fn remove_user(&self, access_key: &str) {
        let mut inner = self.inner.lock();
        inner.users.retain(|u| u.access_key != access_key);
        inner.secrets.remove(access_key);
    }

    pub fn get_secret_by_access_key(&self, access_key: &str) -> Option<String> {
        self.inner.lock().secrets.get(access_key).cloned()
    }

    pub fn has_user_by_access_key(&self, access_key: &str) -> bool {
        self.inner
            .lock()
            .users
            .iter()
            .any(|u| u.access_key == access_key)
    }

    pub fn has_user_by_username(&self, username: &str) -> bool {
        self.inner
            .lock()
            .users
            .iter()
            .any(|u| u.username == username)
    }

    pub fn list_users(&self) -> Vec<User> {
        self.inner.lock().users.clone()
    }
}

/// Write-temp-then-rename with an optional file mode. The mode applies at
/// creation so secrets never sit on disk with wider permissions.
fn write_replace(path: &Path, contents: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let tmp = path.with_extension("dat.tmp");
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if let Some(mode) = mode {
            options.mode(mode);
        }
        let mut f = options.open(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn random_alnum(len: usize) -> String {
    // Alphanumeric samples uniformly from [A-Za-z0-9]; thread_rng is a CSPRNG.
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
