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

use clap::Parser;
use s3lite::buffer::BufferPool;
use s3lite::config::Config;
use s3lite::meta::MetaStore;
use s3lite::observability::tracing_setup;
use s3lite::server::{self, Server};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "s3lite")]
#[command(about = "Single-node S3-style object store", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address override, e.g. 127.0.0.1
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Data root override
    #[arg(short, long)]
    data_root: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_setup::init_tracing_from_env();

    let args = Args::parse();
    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    if let Some(port) = args.port {
        cfg.listen_port = port;
    }
    if let Some(root) = args.data_root {
        cfg.data_root = root;
    }

    std::fs::create_dir_all(cfg.data_root_path()).map_err(|e| {
        tracing::error!(data_root = %cfg.data_root, error = %e, "cannot create data root");
        e
    })?;

    let store = MetaStore::new();
    store.load(&cfg.data_root_path()).map_err(|e| {
        tracing::error!(error = %e, "metadata load failed");
        e
    })?;
    // Root first so the configured credentials win over the user file.
    store.ensure_root_user(&cfg.access_key, &cfg.secret_key);
    store.load_user_dat().map_err(|e| {
        tracing::error!(error = %e, "user database load failed");
        e
    })?;
    store.save().map_err(|e| {
        tracing::error!(error = %e, "initial snapshot failed");
        e
    })?;

    let pool = BufferPool::new(cfg.buffer_payload_size, cfg.buffer_count);
    let cfg = Arc::new(cfg);
    let server = Server::bind(cfg.clone(), Arc::new(store), pool).map_err(|e| {
        tracing::error!(
            addr = %cfg.listen_addr,
            port = cfg.listen_port,
            error = %e,
            "bind failed"
        );
        e
    })?;

    tracing::info!(
        addr = %cfg.listen_addr,
        port = cfg.listen_port,
        data_root = %cfg.data_root,
        buffers = cfg.buffer_count,
        "s3lite listening"
    );

    server::install_signal_handlers();
    server.run(server::shutdown_flag());
    tracing::info!("server exited");
    Ok(())
}
