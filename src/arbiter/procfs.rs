//! Linux listener discovery through procfs

use std::collections::HashSet;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

use super::Discovery;

/// `st` column value for a listening socket.
const TCP_LISTEN: &str = "0A";

pub(crate) fn listening_pids(port: u16) -> io::Result<Discovery> {
    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match fs::read_to_string(table) {
            Ok(contents) => inodes.extend(listen_inodes(&contents, port)),
            // No IPv6 on this host.
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    let mut discovery = Discovery::default();
    if inodes.is_empty() {
        return Ok(discovery);
    }

    for entry in fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };

        let fds = match fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                discovery.partial = true;
                continue;
            }
            // Process exited while scanning.
            Err(_) => continue,
        };

        let owns_listener = fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .ok()
                .and_then(|target| socket_inode(&target))
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if owns_listener {
            discovery.pids.push(pid);
        }
    }
    Ok(discovery)
}

/// Inodes of LISTEN sockets on `port` in a `/proc/net/tcp`-format table.
fn listen_inodes(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            if u16::from_str_radix(port_hex, 16).ok()? != port {
                return None;
            }
            fields[9].parse::<u64>().ok().filter(|&inode| inode != 0)
        })
        .collect()
}

/// `socket:[12345]` → `12345`
fn socket_inode(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
