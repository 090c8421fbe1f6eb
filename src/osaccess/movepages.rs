//! Typed wrapper over the `move_pages(2)` syscall.
use crate::{deps::log::debug, error::Error, node::Node};

pub const MPOL_MF_MOVE: i32 = 1 << 1;

/// Result of a `move_pages` call: the syscall's own return value plus a
/// per-page status/errno (for migrated pages, the destination node id on
/// success or a negative errno on failure; for query-mode calls, the
/// page's current node).
#[derive(Debug)]
pub struct MovePagesResult {
    pub sys_ret: i32,
    pub status:  Vec<i32>,
}

/// Invokes `move_pages(pid, pages.len(), pages, dest_nodes, status, flags)`.
///
/// `dest_nodes == None` queries current locations only (kernel semantics:
/// a null `nodes` pointer leaves pages in place and just reports status).
pub fn move_pages(
    pid: i32,
    pages: &[u64],
    dest_nodes: Option<&[Node]>,
    flags: i32,
) -> Result<MovePagesResult, Error> {
    let count = pages.len();
    let mut status = vec![0i32; count];

    let nodes_buf: Option<Vec<i32>> = dest_nodes.map(|ds| ds.iter().map(Node::raw).collect());

    if let Some(ref ds) = nodes_buf {
        if ds.len() != count {
            return Err(Error::syscall(
                "move_pages",
                "dest_nodes length did not match pages length",
            ));
        }
    }

    debug!(
        "move_pages(pid={}, count={}, query_only={})",
        pid,
        count,
        nodes_buf.is_none()
    );

    let nodes_ptr = nodes_buf.as_ref().map(|v| v.as_ptr()).unwrap_or(std::ptr::null());

    let sys_ret = unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            pid as libc::pid_t,
            count as libc::c_ulong,
            pages.as_ptr(),
            nodes_ptr,
            status.as_mut_ptr(),
            flags as libc::c_int,
        )
    };

    if sys_ret < 0 {
        let errno = std::io::Error::last_os_error();
        return Err(Error::syscall("move_pages", errno));
    }

    Ok(MovePagesResult { sys_ret: sys_ret as i32, status })
}
