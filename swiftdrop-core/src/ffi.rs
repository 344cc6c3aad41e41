//! C ABI for linking swiftdrop-core as a static library from Android (NDK) or other C/C++ hosts.
//! The JNI glue calls these from the plugin's WifiP2pManager callbacks.
//!
//! Commands return 0 on ack, -1 on bad arguments, or `SessionError::code()`. Provider calls and
//! session events are queued in the handle; drain them with `swiftdrop_poll_calls` and
//! `swiftdrop_poll_events`, which write length-prefixed bincode frames (see wire).

use std::collections::VecDeque;
use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use serde::Serialize;

use crate::core::SessionCore;
use crate::negotiator::ConnectionInfo;
use crate::peer::PeerRecord;
use crate::protocol::{ProviderCall, SessionEvent, PROTOCOL_VERSION};
use crate::wire::{decode_frame, encode_frame};

/// Core plus the queues the host drains.
struct FfiSession {
    core: SessionCore,
    calls: VecDeque<ProviderCall>,
    events: VecDeque<SessionEvent>,
}

impl FfiSession {
    fn collect(&mut self, calls: Vec<ProviderCall>) {
        self.calls.extend(calls);
        self.events.extend(self.core.drain_events());
    }
}

unsafe fn session<'a>(h: *mut c_void) -> Option<&'a mut FfiSession> {
    (h as *mut FfiSession).as_mut()
}

/// UTF-8 text from the host. Null yields an empty string; invalid bytes are replaced.
unsafe fn read_text(ptr: *const u8, len: usize) -> String {
    if ptr.is_null() || len == 0 {
        return String::new();
    }
    String::from_utf8_lossy(slice::from_raw_parts(ptr, len)).into_owned()
}

fn outcome(ok: c_int, reason: String) -> Result<(), String> {
    if ok != 0 {
        Ok(())
    } else {
        Err(reason)
    }
}

/// Write one frame into out_buf. Returns bytes written, or -1 if it does not fit.
fn write_frame<T: Serialize>(value: &T, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    if out_buf.is_null() {
        return -1;
    }
    let frame = match encode_frame(value) {
        Ok(f) => f,
        Err(_) => return -1,
    };
    if frame.len() > usable_len(out_buf_len) {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(frame.as_ptr(), frame.len());
    }
    frame.len() as c_int
}

/// Host buffer length we will fill: byte counts are returned as c_int.
fn usable_len(out_buf_len: usize) -> usize {
    out_buf_len.min(c_int::MAX as usize)
}

/// Move as many whole frames from `queue` into out_buf as fit. Returns bytes written,
/// 0 when the queue is empty, -1 if the next frame alone is larger than out_buf.
fn drain_frames<T: Serialize>(queue: &mut VecDeque<T>, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    if queue.is_empty() {
        return 0;
    }
    if out_buf.is_null() {
        return -1;
    }
    let buf = unsafe { slice::from_raw_parts_mut(out_buf, usable_len(out_buf_len)) };
    let mut off = 0usize;
    while let Some(next) = queue.front() {
        let frame = match encode_frame(next) {
            Ok(f) => f,
            Err(_) => return -1,
        };
        if off + frame.len() > buf.len() {
            break;
        }
        buf[off..off + frame.len()].copy_from_slice(&frame);
        off += frame.len();
        queue.pop_front();
    }
    if off == 0 {
        return -1;
    }
    off as c_int
}

fn status(result: Result<Vec<ProviderCall>, crate::SessionError>, s: &mut FfiSession) -> c_int {
    match result {
        Ok(calls) => {
            s.collect(calls);
            0
        }
        Err(e) => {
            s.collect(vec![]);
            e.code()
        }
    }
}

/// Returns the frame layout version.
#[no_mangle]
pub extern "C" fn swiftdrop_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Create a new session. Returns opaque handle.
#[no_mangle]
pub extern "C" fn swiftdrop_session_create() -> *mut c_void {
    let s = FfiSession {
        core: SessionCore::new(),
        calls: VecDeque::new(),
        events: VecDeque::new(),
    };
    Box::into_raw(Box::new(s)) as *mut c_void
}

/// Destroy a session. No-op if h is null.
#[no_mangle]
pub extern "C" fn swiftdrop_session_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut FfiSession) };
}

/// Provider initialize() finished. ok != 0 means success; otherwise reason is reported.
#[no_mangle]
pub extern "C" fn swiftdrop_on_initialized(
    h: *mut c_void,
    ok: c_int,
    reason: *const u8,
    reason_len: usize,
) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let reason = unsafe { read_text(reason, reason_len) };
    s.core.on_initialized(outcome(ok, reason));
    s.collect(vec![]);
    0
}

/// WIFI_P2P_STATE_CHANGED: enabled != 0 when P2P is on.
#[no_mangle]
pub extern "C" fn swiftdrop_on_capability_changed(h: *mut c_void, enabled: c_int) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    s.core.on_capability_changed(enabled != 0);
    s.collect(vec![]);
    0
}

#[no_mangle]
pub extern "C" fn swiftdrop_start_discovery(h: *mut c_void) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let result = s.core.start_discovery();
    status(result, s)
}

/// Always 0 for a valid handle.
#[no_mangle]
pub extern "C" fn swiftdrop_stop_discovery(h: *mut c_void) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let calls = s.core.stop_discovery();
    s.collect(calls);
    0
}

/// Connect to a peer. address is UTF-8, address_len bytes.
#[no_mangle]
pub extern "C" fn swiftdrop_connect(h: *mut c_void, address: *const u8, address_len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    if address.is_null() {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(address, address_len) };
    let Ok(address) = std::str::from_utf8(bytes) else {
        return -1;
    };
    let result = s.core.connect(address);
    status(result, s)
}

/// Always 0 for a valid handle.
#[no_mangle]
pub extern "C" fn swiftdrop_teardown(h: *mut c_void) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let calls = s.core.teardown();
    s.collect(calls);
    0
}

#[no_mangle]
pub extern "C" fn swiftdrop_refresh_peers(h: *mut c_void) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let result = s.core.refresh_peers();
    status(result, s)
}

/// Write the current peer list as one frame (`Vec<Peer>`). Returns bytes written,
/// -1 on bad arguments or a too-small buffer, or a SessionError code.
#[no_mangle]
pub extern "C" fn swiftdrop_list_peers(h: *mut c_void, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    match s.core.list_peers() {
        Ok(peers) => write_frame(&peers.to_vec(), out_buf, out_buf_len),
        Err(e) => e.code(),
    }
}

/// Write a `SessionSnapshot` frame. Returns bytes written or -1.
#[no_mangle]
pub extern "C" fn swiftdrop_snapshot(h: *mut c_void, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    write_frame(&s.core.snapshot(), out_buf, out_buf_len)
}

#[no_mangle]
pub extern "C" fn swiftdrop_on_discovery_started(
    h: *mut c_void,
    epoch: u64,
    ok: c_int,
    reason: *const u8,
    reason_len: usize,
) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let reason = unsafe { read_text(reason, reason_len) };
    let calls = s.core.on_discovery_started(epoch, outcome(ok, reason));
    s.collect(calls);
    0
}

#[no_mangle]
pub extern "C" fn swiftdrop_on_discovery_stopped(
    h: *mut c_void,
    epoch: u64,
    ok: c_int,
    reason: *const u8,
    reason_len: usize,
) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let reason = unsafe { read_text(reason, reason_len) };
    s.core.on_discovery_stopped(epoch, outcome(ok, reason));
    s.collect(vec![]);
    0
}

/// Negotiation finished. On success, is_group_owner and the optional group owner address
/// (UTF-8 IP literal, may be null) describe the group; on failure, reason is reported.
#[no_mangle]
pub extern "C" fn swiftdrop_on_connect_result(
    h: *mut c_void,
    epoch: u64,
    ok: c_int,
    is_group_owner: c_int,
    group_owner_address: *const u8,
    group_owner_address_len: usize,
    reason: *const u8,
    reason_len: usize,
) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let result = if ok != 0 {
        let addr = unsafe { read_text(group_owner_address, group_owner_address_len) };
        Ok(ConnectionInfo {
            is_group_owner: is_group_owner != 0,
            group_owner_address: addr.parse().ok(),
        })
    } else {
        Err(unsafe { read_text(reason, reason_len) })
    };
    let calls = s.core.on_connect_result(epoch, result);
    s.collect(calls);
    0
}

/// Peer list from requestPeers: one frame holding `Vec<PeerRecord>`.
#[no_mangle]
pub extern "C" fn swiftdrop_on_peers_available(h: *mut c_void, frame: *const u8, frame_len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    if frame.is_null() {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(frame, frame_len) };
    let records: Vec<PeerRecord> = match decode_frame(bytes) {
        Ok((r, _)) => r,
        Err(_) => return -1,
    };
    s.core.on_peers_available(records);
    s.collect(vec![]);
    0
}

#[no_mangle]
pub extern "C" fn swiftdrop_on_group_removed(
    h: *mut c_void,
    ok: c_int,
    reason: *const u8,
    reason_len: usize,
) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let reason = unsafe { read_text(reason, reason_len) };
    s.core.on_group_removed(outcome(ok, reason));
    s.collect(vec![]);
    0
}

/// Periodic tick. Queues a peer-list request while discovering.
#[no_mangle]
pub extern "C" fn swiftdrop_tick(h: *mut c_void) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    let calls = s.core.tick();
    s.collect(calls);
    0
}

/// Drain queued provider calls as `ProviderCall` frames. Returns bytes written, 0 if none, -1 on error.
#[no_mangle]
pub extern "C" fn swiftdrop_poll_calls(h: *mut c_void, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    drain_frames(&mut s.calls, out_buf, out_buf_len)
}

/// Drain queued session events as `SessionEvent` frames. Returns bytes written, 0 if none, -1 on error.
#[no_mangle]
pub extern "C" fn swiftdrop_poll_events(h: *mut c_void, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let Some(s) = (unsafe { session(h) }) else {
        return -1;
    };
    drain_frames(&mut s.events, out_buf, out_buf_len)
}
