//! Renders the routing model into nginx configuration files.
//!
//! Rendering is a pure function of the model: the same model always produces
//! byte-identical output. Writing goes through [`ConfigWriter`], which stages
//! every file of a change before renaming any of them into place so a reload
//! never observes a half-written configuration.

use crate::model::{EntryPoint, Node, RoutingModel};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

const GENERATED_HEADER: &str = "# Generated by routekeeper. Manual edits are overwritten.\n";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("node '{0}' has no endpoints to forward to")]
    NoEndpoints(String),

    #[error("node '{0}' would overwrite the aggregate configuration file")]
    ReservedNodeId(String),

    #[error("entry point {domain}{path} references missing node '{node_id}'")]
    DanglingReference {
        domain: String,
        path: String,
        node_id: String,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A rendered configuration file ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Render the server block for a single node.
///
/// The first endpoint serves `location /`; any further endpoints follow in
/// order as named locations so every destination is kept in the file.
pub fn render_node(node: &Node, listen_port: u16) -> Result<String, RenderError> {
    let (primary, rest) = node
        .endpoints
        .split_first()
        .ok_or_else(|| RenderError::NoEndpoints(node.node_id.clone()))?;

    let mut out = String::from(GENERATED_HEADER);
    out.push_str("server {\n");
    out.push_str(&format!("\tlisten {};\n", listen_port));
    out.push_str(&format!("\tserver_name {};\n", node.node_id));
    out.push_str("\tlocation / {\n");
    out.push_str(&format!("\t\tproxy_pass {};\n", primary.destination));
    out.push_str("\t}\n");
    for (i, endpoint) in rest.iter().enumerate() {
        out.push_str(&format!("\tlocation @{}-{} {{\n", node.node_id, i + 1));
        out.push_str(&format!("\t\tproxy_pass {};\n", endpoint.destination));
        out.push_str("\t}\n");
    }
    out.push_str("}\n");
    Ok(out)
}

/// Render one server block per domain.
///
/// Domains appear in the order of their first entry point; each block holds
/// that domain's locations in model order. nginx ignores a second server block
/// with the same `server_name`, so a domain is never split across blocks.
pub fn render_entry_points(model: &RoutingModel, listen_port: u16) -> Result<String, RenderError> {
    let mut domains: Vec<(&str, Vec<&EntryPoint>)> = Vec::new();
    for entry in model.entry_points() {
        match domains.iter_mut().find(|(domain, _)| *domain == entry.domain) {
            Some((_, entries)) => entries.push(entry),
            None => domains.push((entry.domain.as_str(), vec![entry])),
        }
    }

    let mut out = String::from(GENERATED_HEADER);
    for (domain, entries) in domains {
        out.push_str("server {\n");
        out.push_str(&format!("\tlisten {};\n", listen_port));
        out.push_str(&format!("\tserver_name {};\n", domain));

        for entry in entries {
            let node = model
                .resolve(entry)
                .map_err(|_| RenderError::DanglingReference {
                    domain: entry.domain.clone(),
                    path: entry.path.clone(),
                    node_id: entry.node_id.clone(),
                })?;
            let endpoint = node
                .primary_endpoint()
                .ok_or_else(|| RenderError::NoEndpoints(node.node_id.clone()))?;

            out.push_str(&format!("\tlocation {} {{\n", entry.path));
            out.push_str(&format!("\t\tproxy_pass {};\n", endpoint.destination));
            out.push_str("\t\tproxy_redirect default;\n");
            out.push_str("\t\tproxy_set_header Host $host;\n");
            out.push_str("\t\tproxy_set_header X-Real-IP $remote_addr;\n");
            out.push_str("\t\tproxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
            out.push_str("\t}\n");
        }
        out.push_str("}\n");
    }

    Ok(out)
}

/// Render the top-level nginx.conf that includes the generated files
pub fn render_main_config(conf_dir: &Path, listen_port: u16) -> String {
    format!(
        r#"user nginx;
worker_processes auto;
error_log /var/log/nginx/error.log;
pid /run/nginx.pid;

events {{
    worker_connections 1024;
}}

http {{
    log_format  main  '$remote_addr - $remote_user [$time_local] "$request" '
                      '$status $body_bytes_sent "$http_referer" '
                      '"$http_user_agent" "$http_x_forwarded_for"';

    access_log  /var/log/nginx/access.log  main;

    sendfile            on;
    tcp_nopush          on;
    tcp_nodelay         on;
    keepalive_timeout   65;
    types_hash_max_size 2048;

    include             /etc/nginx/mime.types;
    default_type        application/octet-stream;

    include {conf_dir}/*.conf;

    server {{
        listen       {port} default_server;
        listen       [::]:{port} default_server;
        server_name  _;

        include /etc/nginx/default.d/*.conf;
    }}
}}
"#,
        conf_dir = conf_dir.display(),
        port = listen_port,
    )
}

/// Knows where generated files live and writes them atomically
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    conf_dir: PathBuf,
    aggregate_name: String,
    listen_port: u16,
}

impl ConfigWriter {
    pub fn new(conf_dir: impl Into<PathBuf>, aggregate_name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            aggregate_name: aggregate_name.into(),
            listen_port,
        }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// File stem of the aggregate file; no node may share it
    pub fn aggregate_name(&self) -> &str {
        &self.aggregate_name
    }

    pub fn node_path(&self, node_id: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", node_id))
    }

    pub fn aggregate_path(&self) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", self.aggregate_name))
    }

    pub fn render_node_file(&self, node: &Node) -> Result<RenderedFile, RenderError> {
        if node.node_id == self.aggregate_name {
            return Err(RenderError::ReservedNodeId(node.node_id.clone()));
        }
        Ok(RenderedFile {
            path: self.node_path(&node.node_id),
            contents: render_node(node, self.listen_port)?,
        })
    }

    pub fn render_aggregate_file(&self, model: &RoutingModel) -> Result<RenderedFile, RenderError> {
        Ok(RenderedFile {
            path: self.aggregate_path(),
            contents: render_entry_points(model, self.listen_port)?,
        })
    }

    /// Every node file followed by the aggregate file
    pub fn render_all(&self, model: &RoutingModel) -> Result<Vec<RenderedFile>, RenderError> {
        let mut files = model
            .nodes()
            .iter()
            .map(|node| self.render_node_file(node))
            .collect::<Result<Vec<_>, _>>()?;
        files.push(self.render_aggregate_file(model)?);
        Ok(files)
    }

    /// Stage all files next to their targets, then rename them into place.
    ///
    /// A failure while staging leaves every target untouched.
    pub fn write(&self, files: &[RenderedFile]) -> Result<(), RenderError> {
        let staged = files
            .iter()
            .map(|file| stage(&file.path, file.contents.as_bytes()).map(|tmp| (tmp, &file.path)))
            .collect::<Result<Vec<_>, _>>()?;

        for (tmp, path) in staged {
            tmp.persist(path).map_err(|e| RenderError::Io {
                path: path.clone(),
                source: e.error,
            })?;
            debug!(path = %path.display(), "Wrote proxy configuration");
        }
        Ok(())
    }
}

/// Write a single file atomically (temp file in the same directory, fsync, rename)
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), RenderError> {
    stage(path, contents)?
        .persist(path)
        .map_err(|e| RenderError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

fn stage(path: &Path, contents: &[u8]) -> Result<NamedTempFile, RenderError> {
    let io_err = |source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;

    // Temp files are created 0600; the proxy may read them as another user
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(io_err)?;
    }

    Ok(tmp)
}
