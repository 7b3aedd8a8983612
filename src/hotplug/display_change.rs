// SPDX-License-Identifier: GPL-3.0-only
//! `WM_DISPLAYCHANGE` listener
//!
//! Windows broadcasts `WM_DISPLAYCHANGE` to top-level windows only, so this
//! creates a hidden (never shown) top-level window and pumps its messages on
//! the calling thread.

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use windows_sys::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DispatchMessageW, GetMessageW, MSG, PostQuitMessage,
    RegisterClassW, TranslateMessage, WM_DISPLAYCHANGE, WNDCLASSW,
};

use crate::error::PlatformError;

use super::subscription::{TopologyChanged, forward};

/// The window procedure has no user pointer; the sender lives here
static SENDER: OnceCell<mpsc::Sender<TopologyChanged>> = OnceCell::new();

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

unsafe extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if msg == WM_DISPLAYCHANGE {
        debug!("WM_DISPLAYCHANGE received");
        if let Some(tx) = SENDER.get() {
            if !forward(tx) {
                // SAFETY: called on the thread that owns the message loop
                unsafe { PostQuitMessage(0) };
            }
        }
        return 0;
    }

    // SAFETY: forwarding the untouched arguments we were called with
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}

fn create_window() -> Result<HWND, PlatformError> {
    let class_name = wide("VirtualMonitorHelperDisplayWatcher");

    // SAFETY: a null module name returns the handle of the current executable
    let instance = unsafe { GetModuleHandleW(std::ptr::null()) };

    // SAFETY: WNDCLASSW is plain data; all-zero is a valid value
    let mut class: WNDCLASSW = unsafe { std::mem::zeroed() };
    class.lpfnWndProc = Some(window_proc);
    class.hInstance = instance;
    class.lpszClassName = class_name.as_ptr();

    // SAFETY: `class` and the class name outlive the call
    if unsafe { RegisterClassW(&class) } == 0 {
        return Err(PlatformError::Subscription(format!(
            "RegisterClassW failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: the class was registered above; all pointers are valid or null
    let hwnd = unsafe {
        CreateWindowExW(
            0,
            class_name.as_ptr(),
            class_name.as_ptr(),
            0,
            0,
            0,
            0,
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            instance,
            std::ptr::null(),
        )
    };
    if hwnd.is_null() {
        return Err(PlatformError::Subscription(format!(
            "CreateWindowExW failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(hwnd)
}

/// Create the listener window and pump messages until the channel closes
pub fn run(tx: mpsc::Sender<TopologyChanged>, ready: std::sync::mpsc::SyncSender<Result<(), PlatformError>>) {
    if SENDER.set(tx).is_err() {
        let _ = ready.send(Err(PlatformError::Subscription(
            "display change notifications are already subscribed".to_string(),
        )));
        return;
    }

    if let Err(e) = create_window() {
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));
    info!("Display change monitoring started");

    // SAFETY: MSG is plain data; all-zero is a valid value
    let mut msg: MSG = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: `msg` is writable; a null window pulls every message of this thread
        let ret = unsafe { GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) };
        if ret == 0 {
            break;
        }
        if ret == -1 {
            error!("GetMessageW failed: {}", std::io::Error::last_os_error());
            break;
        }
        // SAFETY: `msg` was filled in by GetMessageW
        unsafe {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    info!("Display change monitoring stopped");
}
