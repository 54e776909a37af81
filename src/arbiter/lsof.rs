//! Listener discovery via lsof (macOS, BSDs)

use std::io::{self, ErrorKind};
use std::process::Command;

use super::Discovery;

pub(crate) fn listening_pids(port: u16) -> io::Result<Discovery> {
    let lsof = which::which("lsof").map_err(|e| io::Error::new(ErrorKind::NotFound, e))?;

    let output = Command::new(lsof)
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()?;

    // lsof exits 1 with empty output when nothing matches.
    let pids = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect();

    Ok(Discovery {
        pids,
        partial: false,
    })
}
