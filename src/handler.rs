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

//! Request routing and the bucket/object/user operations.
//!
//! Paths are routed by their first segment after normalization. All bucket
//! and object operations are scoped to the verified requester's access key
//! as the owner id; `/_admin/*` additionally requires the configured
//! administrator key. Metadata mutations follow the mutate-snapshot-rollback
//! protocol: apply in memory, `save()`, and undo the in-memory change when
//! the snapshot fails.

use serde_json::json;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::auth::AuthContext;
use crate::buffer::{BufferPool, Msg};
use crate::config::Config;
use crate::file_io;
use crate::meta::{now_iso8601, MetaError, MetaStore};
use crate::response::{write_error, write_json, write_response};

/// Handle one parsed, authenticated request, composing the response into
/// `out`. Returns false only when the pool ran dry while composing; the
/// caller then attempts a minimal 503.
pub fn handle_request(
    req: &crate::http::Request,
    body: Option<&Msg>,
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    let path = req.path.trim_start_matches('/');
    let (op, rest) = match path.split_once('/') {
        Some((op, rest)) => (op, rest),
        None => (path, ""),
    };

    match (req.method.as_str(), op) {
        ("POST", "_admin") if rest == "users" => admin_create_user(body, ctx, cfg, store, pool, out),
        ("GET", "_admin") if rest == "users" => admin_list_users(ctx, cfg, store, pool, out),
        ("GET", "getBucket") if rest.is_empty() => list_buckets(ctx, store, pool, out),
        ("GET", "getBucket") => list_objects(rest, ctx, store, pool, out),
        ("GET", "getObject") => match split_bucket_key(rest) {
            Some((bucket, key)) => get_object(bucket, key, ctx, cfg, store, pool, out),
            None => write_error(out, pool, 400, "BadRequest", "Missing bucket or key"),
        },
        ("PUT", "createBucket") => create_bucket(rest, ctx, cfg, store, pool, out),
        ("PUT", "createObject") => match split_bucket_key(rest) {
            Some((bucket, key)) => create_object(bucket, key, body, ctx, cfg, store, pool, out),
            None => write_error(out, pool, 400, "BadRequest", "Missing bucket or key"),
        },
        ("DELETE", "deleteBucket") => delete_bucket(rest, ctx, cfg, store, pool, out),
        ("DELETE", "deleteObject") => match split_bucket_key(rest) {
            Some((bucket, key)) => delete_object(bucket, key, ctx, cfg, store, pool, out),
            None => write_error(out, pool, 400, "BadRequest", "Missing bucket or key"),
        },
        _ => write_error(out, pool, 400, "BadRequest", "Unsupported method or path"),
    }
}

fn split_bucket_key(rest: &str) -> Option<(&str, &str)> {
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

fn valid_bucket_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains("..")
        && !name.contains('\t')
        && !name.contains('\n')
}

fn valid_object_key(key: &str) -> bool {
    !key.is_empty() && !key.contains("..") && !key.contains('\t') && !key.contains('\n')
}

/// Directory holding a bucket's objects. The owner prefix keeps equal bucket
/// names from different owners apart on disk; clients never see it.
fn bucket_dir(cfg: &Config, owner: &str, bucket: &str) -> PathBuf {
    cfg.data_root_path()
        .join("s3")
        .join(format!("{owner}_{bucket}"))
}

fn object_path(cfg: &Config, owner: &str, bucket: &str, key: &str) -> PathBuf {
    let mut path = bucket_dir(cfg, owner, bucket);
    for comp in key.split('/') {
        path.push(comp);
    }
    path
}

/// A storage path loaded from metadata must stay under `<data_root>/s3`;
/// anything else means the metadata file was tampered with.
fn storage_path_is_safe(cfg: &Config, stored: &str) -> bool {
    let path = Path::new(stored);
    path.starts_with(cfg.data_root_path().join("s3"))
        && path
            .components()
            .all(|c| !matches!(c, Component::ParentDir))
}

// ---- bucket operations ----

fn list_buckets(ctx: &AuthContext, store: &MetaStore, pool: &BufferPool, out: &mut Msg) -> bool {
    let buckets: Vec<_> = store
        .list_buckets_by_owner(&ctx.access_key)
        .into_iter()
        .map(|b| json!({ "name": b.name, "created_at": b.created_at }))
        .collect();
    write_json(out, pool, 200, &json!({ "code": 1, "buckets": buckets }))
}

fn list_objects(
    bucket: &str,
    ctx: &AuthContext,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    if !valid_bucket_name(bucket) {
        return write_error(out, pool, 400, "BadRequest", "Invalid bucket name");
    }
    let Some(b) = store.get_bucket_by_name_and_owner(bucket, &ctx.access_key) else {
        return write_error(out, pool, 404, "NoSuchBucket", "Bucket not found");
    };
    let objects: Vec<_> = store
        .list_objects(b.id)
        .into_iter()
        .map(|o| {
            json!({
                "key": o.key,
                "size": o.size,
                "last_modified": o.last_modified,
                "etag": o.etag,
            })
        })
        .collect();
    write_json(
        out,
        pool,
        200,
        &json!({ "code": 1, "bucket": b.name, "objects": objects }),
    )
}

fn create_bucket(
    bucket: &str,
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    if !valid_bucket_name(bucket) {
        return write_error(out, pool, 400, "BadRequest", "Invalid bucket name");
    }
    let Some(id) = store.create_bucket(bucket, &ctx.access_key) else {
        // Same (name, owner) already recorded once; creating it again is a
        // success with no metadata change.
        return write_json(out, pool, 200, &json!({ "code": 1 }));
    };
    if let Err(e) = store.save() {
        store.delete_bucket(id);
        return save_failed(out, pool, &e);
    }
    let dir = bucket_dir(cfg, &ctx.access_key, bucket);
    if let Err(e) = fs::create_dir_all(&dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "bucket directory create failed");
    }
    tracing::info!(bucket, owner = %ctx.access_key, id, "bucket created");
    write_json(out, pool, 200, &json!({ "code": 1 }))
}

fn delete_bucket(
    bucket: &str,
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    if !valid_bucket_name(bucket) {
        return write_error(out, pool, 400, "BadRequest", "Invalid bucket name");
    }
    let Some(b) = store.get_bucket_by_name_and_owner(bucket, &ctx.access_key) else {
        return write_error(out, pool, 404, "NoSuchBucket", "Bucket not found");
    };
    if !store.list_objects(b.id).is_empty() {
        return write_error(
            out,
            pool,
            409,
            "BucketNotEmpty",
            "The bucket you tried to delete is not empty",
        );
    }
    store.delete_bucket(b.id);
    if let Err(e) = store.save() {
        store.restore_bucket(b);
        return save_failed(out, pool, &e);
    }
    let dir = bucket_dir(cfg, &ctx.access_key, bucket);
    let _ = fs::remove_dir(&dir);
    tracing::info!(bucket, owner = %ctx.access_key, "bucket deleted");
    write_json(out, pool, 200, &json!({ "code": 1 }))
}

// ---- object operations ----

fn get_object(
    bucket: &str,
    key: &str,
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    let Some(b) = store.get_bucket_by_name_and_owner(bucket, &ctx.access_key) else {
        return write_error(out, pool, 404, "NoSuchBucket", "Bucket not found");
    };
    let Some(obj) = store.get_object(b.id, key) else {
        return write_error(out, pool, 404, "NoSuchKey", "Object not found");
    };
    if !storage_path_is_safe(cfg, &obj.storage_path) {
        tracing::error!(path = %obj.storage_path, "storage path escapes the data root");
        return write_error(out, pool, 503, "InternalError", "Invalid storage path");
    }

    let size = obj.size as usize;
    let mut data = vec![0u8; size];
    match file_io::read_file(Path::new(&obj.storage_path), &mut data) {
        Ok(n) if n == size => {}
        Ok(n) => {
            tracing::error!(path = %obj.storage_path, expected = size, got = n, "short read");
            return write_error(out, pool, 503, "InternalError", "Read failed");
        }
        Err(e) => {
            tracing::error!(path = %obj.storage_path, error = %e, "object read failed");
            return write_error(out, pool, 503, "InternalError", "Read failed");
        }
    }
    write_response(out, pool, 200, Some("application/octet-stream"), &data)
}

#[allow(clippy::too_many_arguments)]
fn create_object(
    bucket: &str,
    key: &str,
    body: Option<&Msg>,
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    if !valid_bucket_name(bucket) {
        return write_error(out, pool, 400, "BadRequest", "Invalid bucket name");
    }
    if !valid_object_key(key) {
        return write_error(out, pool, 400, "BadRequest", "Invalid object key");
    }
    let Some(body) = body.filter(|b| !b.is_empty()) else {
        return write_error(out, pool, 400, "BadRequest", "Object body required");
    };
    let Some(b) = store.get_bucket_by_name_and_owner(bucket, &ctx.access_key) else {
        return write_error(out, pool, 404, "NoSuchBucket", "Bucket not found");
    };
    if store.get_object(b.id, key).is_some() {
        return write_error(out, pool, 409, "ObjectAlreadyExists", "Object already exists");
    }

    let path = object_path(cfg, &ctx.access_key, bucket, key);
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(dir = %parent.display(), error = %e, "object directory create failed");
            return write_error(out, pool, 503, "InternalError", "Write failed");
        }
    }

    let data = body.to_vec();
    match file_io::write_file(&path, &data) {
        Ok(n) if n == data.len() => {}
        _ => {
            let _ = fs::remove_file(&path);
            return write_error(out, pool, 503, "InternalError", "Write failed");
        }
    }

    store.put_object(
        b.id,
        key,
        data.len() as i64,
        &now_iso8601(),
        "",
        &path.to_string_lossy(),
        "private",
    );
    if let Err(e) = store.save() {
        // The body stays on disk as an orphan; a startup scan can collect it.
        store.delete_object(b.id, key);
        return save_failed(out, pool, &e);
    }
    tracing::info!(bucket, key, size = data.len(), "object created");
    write_json(out, pool, 200, &json!({ "code": 1 }))
}

fn delete_object(
    bucket: &str,
    key: &str,
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    let Some(b) = store.get_bucket_by_name_and_owner(bucket, &ctx.access_key) else {
        return write_error(out, pool, 404, "NoSuchBucket", "Bucket not found");
    };
    let Some(obj) = store.get_object(b.id, key) else {
        return write_error(out, pool, 404, "NoSuchKey", "Object not found");
    };
    if !storage_path_is_safe(cfg, &obj.storage_path) {
        tracing::error!(path = %obj.storage_path, "storage path escapes the data root");
        return write_error(out, pool, 503, "InternalError", "Invalid storage path");
    }
    // A file already gone counts as unlinked.
    if let Err(e) = fs::remove_file(&obj.storage_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(path = %obj.storage_path, error = %e, "object unlink failed");
            return write_error(out, pool, 503, "InternalError", "Delete failed");
        }
    }
    store.delete_object(b.id, key);
    if let Err(e) = store.save() {
        store.restore_object(obj);
        return save_failed(out, pool, &e);
    }
    tracing::info!(bucket, key, "object deleted");
    write_json(out, pool, 200, &json!({ "code": 1 }))
}

// ---- administrator operations ----

fn require_admin(ctx: &AuthContext, cfg: &Config) -> bool {
    ctx.access_key == cfg.access_key
}

fn admin_create_user(
    body: Option<&Msg>,
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    if !require_admin(ctx, cfg) {
        return write_error(out, pool, 403, "AccessDenied", "Administrator only");
    }
    let Some(body) = body else {
        return write_error(out, pool, 400, "BadRequest", "Request body required");
    };
    let parsed: Result<serde_json::Value, _> = serde_json::from_slice(&body.to_vec());
    let username = parsed
        .ok()
        .and_then(|v| v.get("username").and_then(|u| u.as_str()).map(String::from));
    let Some(username) = username.filter(|u| !u.is_empty()) else {
        return write_error(out, pool, 400, "BadRequest", "Missing username");
    };

    let user = match store.create_user(&username) {
        Ok(user) => user,
        Err(MetaError::UserExists) => {
            return write_error(out, pool, 409, "UserAlreadyExists", "User already exists")
        }
        Err(_) => return write_error(out, pool, 400, "BadRequest", "Invalid username"),
    };
    if let Err(e) = store.save() {
        store.remove_user(&user.access_key);
        return save_failed(out, pool, &e);
    }
    tracing::info!(username = %user.username, "user created");
    // The secret key is written to user.dat only; it is never returned.
    write_json(
        out,
        pool,
        201,
        &json!({
            "code": 1,
            "user": {
                "id": user.id,
                "username": user.username,
                "access_key": user.access_key,
                "created_at": user.created_at,
            }
        }),
    )
}

fn admin_list_users(
    ctx: &AuthContext,
    cfg: &Config,
    store: &MetaStore,
    pool: &BufferPool,
    out: &mut Msg,
) -> bool {
    if !require_admin(ctx, cfg) {
        return write_error(out, pool, 403, "AccessDenied", "Administrator only");
    }
    let users: Vec<_> = store
        .list_users()
        .into_iter()
        .map(|u| {
            json!({
                "id": u.id,
                "username": u.username,
                "access_key": u.access_key,
                "created_at": u.created_at,
            })
        })
        .collect();
    write_json(out, pool, 200, &json!({ "code": 1, "users": users }))
}

fn save_failed(out: &mut Msg, pool: &BufferPool, err: &MetaError) -> bool {
    tracing::error!(error = %err, "metadata snapshot failed, mutation rolled back");
    write_error(out, pool, 503, "InternalError", "Meta save failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use tempfile::{tempdir, TempDir};

    const OWNER: &str = "AKADMIN";

    struct Harness {
        _dir: TempDir,
        cfg: Config,
        store: MetaStore,
        pool: BufferPool,
        ctx: AuthContext,
    }

    fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let cfg = Config {
            data_root: dir.path().to_string_lossy().into_owned(),
            access_key: OWNER.to_string(),
            secret_key: "SKADMIN".to_string(),
            ..Config::default()
        };
        let store = MetaStore::new();
        store.load(dir.path()).expect("load");
        store.ensure_root_user(&cfg.access_key, &cfg.secret_key);
        Harness {
            _dir: dir,
            cfg,
            store,
            pool: BufferPool::new(65536, 64),
            ctx: AuthContext {
                access_key: OWNER.to_string(),
            },
        }
    }

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            content_length: -1,
            ..Request::default()
        }
    }

    fn run(h: &Harness, method: &str, path: &str, body: Option<&[u8]>) -> (u16, serde_json::Value) {
        let req = request(method, path);
        let mut body_msg = Msg::new();
        if let Some(b) = body {
            assert!(body_msg.copy_in(&h.pool, b));
        }
        let body_ref = body.map(|_| &body_msg);
        let mut out = Msg::new();
        assert!(handle_request(
            &req, body_ref, &h.ctx, &h.cfg, &h.store, &h.pool, &mut out
        ));
        let text = String::from_utf8(out.to_vec()).expect("utf8");
        let status: u16 = text
            .split_whitespace()
            .nth(1)
            .expect("status")
            .parse()
            .expect("numeric status");
        let body = text.split("\r\n\r\n").nth(1).unwrap_or("");
        let value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(body).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    #[test]
    fn bucket_lifecycle_end_to_end() {
        let h = harness();

        let (status, v) = run(&h, "PUT", "/createBucket/mybucket", None);
        assert_eq!((status, v["code"].as_i64()), (200, Some(1)));
        assert!(bucket_dir(&h.cfg, OWNER, "mybucket").is_dir());

        // Creating it again is an idempotent success.
        let (status, v) = run(&h, "PUT", "/createBucket/mybucket", None);
        assert_eq!((status, v["code"].as_i64()), (200, Some(1)));

        let (status, v) = run(&h, "GET", "/getBucket", None);
        assert_eq!(status, 200);
        let names: Vec<_> = v["buckets"]
            .as_array()
            .expect("array")
            .iter()
            .map(|b| b["name"].as_str().unwrap_or(""))
            .collect();
        assert_eq!(names, vec!["mybucket"]);

        let (status, _) = run(&h, "DELETE", "/deleteBucket/mybucket", None);
        assert_eq!(status, 200);
        assert!(!bucket_dir(&h.cfg, OWNER, "mybucket").exists());

        let (status, v) = run(&h, "DELETE", "/deleteBucket/mybucket", None);
        assert_eq!(status, 404);
        assert_eq!(v["Code"], "NoSuchBucket");
    }

    #[test]
    fn object_lifecycle_end_to_end() {
        let h = harness();
        run(&h, "PUT", "/createBucket/mybucket", None);

        let (status, _) = run(&h, "PUT", "/createObject/mybucket/hello.txt", Some(b"hello world"));
        assert_eq!(status, 200);
        let on_disk = h
            .cfg
            .data_root_path()
            .join("s3")
            .join(format!("{OWNER}_mybucket"))
            .join("hello.txt");
        assert_eq!(fs::read(&on_disk).expect("file"), b"hello world");

        // Duplicate create is refused.
        let (status, v) = run(&h, "PUT", "/createObject/mybucket/hello.txt", Some(b"again"));
        assert_eq!(status, 409);
        assert_eq!(v["Code"], "ObjectAlreadyExists");

        // Bucket with an object refuses deletion.
        let (status, v) = run(&h, "DELETE", "/deleteBucket/mybucket", None);
        assert_eq!(status, 409);
        assert_eq!(v["Code"], "BucketNotEmpty");

        let (status, _) = run(&h, "DELETE", "/deleteObject/mybucket/hello.txt", None);
        assert_eq!(status, 200);
        assert!(!on_disk.exists());

        let (status, v) = run(&h, "GET", "/getObject/mybucket/hello.txt", None);
        assert_eq!(status, 404);
        assert_eq!(v["Code"], "NoSuchKey");
    }

    #[test]
    fn get_object_returns_the_exact_bytes() {
        let h = harness();
        run(&h, "PUT", "/createBucket/b", None);
        run(&h, "PUT", "/createObject/b/dir/nested.bin", Some(b"hello world"));

        let req = request("GET", "/getObject/b/dir/nested.bin");
        let mut out = Msg::new();
        assert!(handle_request(
            &req, None, &h.ctx, &h.cfg, &h.store, &h.pool, &mut out
        ));
        let raw = out.to_vec();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
        assert!(raw.ends_with(b"hello world"));
    }

    #[test]
    fn listing_reflects_object_attributes() {
        let h = harness();
        run(&h, "PUT", "/createBucket/b", None);
        run(&h, "PUT", "/createObject/b/k1", Some(b"12345"));

        let (status, v) = run(&h, "GET", "/getBucket/b", None);
        assert_eq!(status, 200);
        let objs = v["objects"].as_array().expect("objects");
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0]["key"], "k1");
        assert_eq!(objs[0]["size"], 5);
    }

    #[test]
    fn owners_do_not_see_each_other() {
        let h = harness();
        run(&h, "PUT", "/createBucket/shared-name", None);

        let other = Harness {
            ctx: AuthContext {
                access_key: "AKOTHER".to_string(),
            },
            ..harness()
        };
        // Same store, different requester.
        let req = request("GET", "/getBucket/shared-name");
        let mut out = Msg::new();
        assert!(handle_request(
            &req, None, &other.ctx, &h.cfg, &h.store, &h.pool, &mut out
        ));
        let text = String::from_utf8(out.to_vec()).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn rejects_bad_names_and_missing_bodies() {
        let h = harness();
        let (status, _) = run(&h, "PUT", "/createBucket/bad..name", None);
        assert_eq!(status, 400);

        run(&h, "PUT", "/createBucket/b", None);
        let (status, v) = run(&h, "PUT", "/createObject/b/k", None);
        assert_eq!(status, 400);
        assert_eq!(v["Code"], "BadRequest");

        let (status, _) = run(&h, "PATCH", "/createBucket/b", None);
        assert_eq!(status, 400);
    }

    #[test]
    fn tampered_storage_paths_are_refused() {
        let h = harness();
        run(&h, "PUT", "/createBucket/b", None);
        let b = h
            .store
            .get_bucket_by_name_and_owner("b", OWNER)
            .expect("bucket");
        h.store
            .put_object(b.id, "evil", 4, "t", "", "/etc/passwd", "private");

        let (status, v) = run(&h, "GET", "/getObject/b/evil", None);
        assert_eq!(status, 503);
        assert_eq!(v["Code"], "InternalError");
        let (status, _) = run(&h, "DELETE", "/deleteObject/b/evil", None);
        assert_eq!(status, 503);
        assert!(Path::new("/etc/passwd").exists(), "must not unlink");
    }

    #[test]
    fn admin_user_flow() {
        let h = harness();

        let (status, v) = run(&h, "POST", "/_admin/users", Some(br#"{"username":"alice"}"#));
        assert_eq!(status, 201);
        assert_eq!(v["code"], 1);
        let access_key = v["user"]["access_key"].as_str().expect("access key");
        assert_eq!(access_key.len(), 20);
        assert!(v["user"].get("secret_key").is_none(), "secret must not leak");

        let (status, v) = run(&h, "POST", "/_admin/users", Some(br#"{"username":"alice"}"#));
        assert_eq!(status, 409);
        assert_eq!(v["Code"], "UserAlreadyExists");

        let (status, v) = run(&h, "GET", "/_admin/users", None);
        assert_eq!(status, 200);
        let users = v["users"].as_array().expect("users");
        assert!(users.iter().any(|u| u["username"] == "alice"));
        assert!(users.iter().all(|u| u.get("secret_key").is_none()));

        // Non-admin callers are shut out.
        let outsider = AuthContext {
            access_key: "AKOTHER".to_string(),
        };
        let req = request("GET", "/_admin/users");
        let mut out = Msg::new();
        assert!(handle_request(
            &req, None, &outsider, &h.cfg, &h.store, &h.pool, &mut out
        ));
        assert!(String::from_utf8(out.to_vec())
            .expect("utf8")
            .starts_with("HTTP/1.1 403"));
    }

    #[test]
    fn snapshot_failure_rolls_the_mutation_back() {
        let h = harness();
        run(&h, "PUT", "/createBucket/b", None);
        // Make the data root unwritable so save() fails.
        fs::remove_dir_all(h.cfg.data_root_path()).expect("nuke root");

        let (status, v) = run(&h, "PUT", "/createBucket/doomed", None);
        assert_eq!(status, 503);
        assert_eq!(v["Code"], "InternalError");
        assert!(
            h.store
                .get_bucket_by_name_and_owner("doomed", OWNER)
                .is_none(),
            "rolled back"
        );
    }
}
