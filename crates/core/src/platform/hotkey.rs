//! Global pause hotkey: Cmd+Shift+P on macOS, Ctrl+Shift+P on Windows.
//! The listener only raises a flag; the host polls it and toggles the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const HOTKEY_LABEL: &str = if cfg!(target_os = "macos") { "Cmd+Shift+P" } else { "Ctrl+Shift+P" };

/// Consume a pending press, if any.
pub fn take_press(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::AcqRel)
}

#[cfg(target_os = "macos")]
pub fn start_hotkey_listener(flag: Arc<AtomicBool>) {
    use std::ffi::c_void;

    type CGEventTapProxy = *mut c_void;
    type CGEventRef = *mut c_void;
    type CFMachPortRef = *mut c_void;
    type CFRunLoopSourceRef = *mut c_void;
    type CFRunLoopRef = *mut c_void;
    type CFStringRef = *const c_void;
    type CGEventMask = u64;
    type CGEventType = u32;
    type CGEventFlags = u64;

    type CGEventTapCallBack =
        unsafe extern "C" fn(CGEventTapProxy, CGEventType, CGEventRef, *mut c_void) -> CGEventRef;

    const HID_EVENT_TAP: u32 = 0;
    const HEAD_INSERT: u32 = 0;
    const LISTEN_ONLY: u32 = 1;
    const KEY_DOWN: u32 = 10;
    const KEYCODE_FIELD: u32 = 9;

    const FLAG_ALT: u64 = 0x0008_0000;
    const FLAG_SHIFT: u64 = 0x0002_0000;
    const FLAG_CMD: u64 = 0x0010_0000;
    const FLAG_CTRL: u64 = 0x0004_0000;

    const KEYCODE_P: i64 = 35;

    extern "C" {
        fn CGEventTapCreate(
            tap: u32,
            place: u32,
            options: u32,
            events_of_interest: CGEventMask,
            callback: CGEventTapCallBack,
            user_info: *mut c_void,
        ) -> CFMachPortRef;
        fn CFMachPortCreateRunLoopSource(allocator: *const c_void, port: CFMachPortRef, order: i64) -> CFRunLoopSourceRef;
        fn CFRunLoopGetCurrent() -> CFRunLoopRef;
        fn CFRunLoopAddSource(rl: CFRunLoopRef, source: CFRunLoopSourceRef, mode: CFStringRef);
        fn CFRunLoopRun();
        fn CGEventGetFlags(event: CGEventRef) -> CGEventFlags;
        fn CGEventGetIntegerValueField(event: CGEventRef, field: u32) -> i64;
        fn CGEventTapEnable(tap: CFMachPortRef, enable: bool);

        static kCFRunLoopCommonModes: CFStringRef;
    }

    unsafe extern "C" fn on_key(
        _proxy: CGEventTapProxy,
        event_type: CGEventType,
        event: CGEventRef,
        user_info: *mut c_void,
    ) -> CGEventRef {
        unsafe {
            if event_type != KEY_DOWN {
                return event;
            }
            let flags = CGEventGetFlags(event);
            let keycode = CGEventGetIntegerValueField(event, KEYCODE_FIELD);
            let chord = flags & (FLAG_CMD | FLAG_SHIFT | FLAG_ALT | FLAG_CTRL);
            if keycode == KEYCODE_P && chord == FLAG_CMD | FLAG_SHIFT {
                let flag = &*(user_info as *const AtomicBool);
                flag.store(true, Ordering::Release);
            }
            event
        }
    }

    std::thread::spawn(move || unsafe {
        let flag_ptr = Arc::into_raw(flag) as *mut c_void;
        let tap = CGEventTapCreate(HID_EVENT_TAP, HEAD_INSERT, LISTEN_ONLY, 1 << KEY_DOWN, on_key, flag_ptr);
        if tap.is_null() {
            tracing::error!(
                target: "hotkey",
                "failed to create event tap for {}; grant Accessibility permission to your terminal",
                HOTKEY_LABEL
            );
            drop(Arc::from_raw(flag_ptr as *const AtomicBool));
            return;
        }
        let source = CFMachPortCreateRunLoopSource(std::ptr::null(), tap, 0);
        CFRunLoopAddSource(CFRunLoopGetCurrent(), source, kCFRunLoopCommonModes);
        CGEventTapEnable(tap, true);
        tracing::info!(target: "hotkey", "global hotkey {} toggles pause", HOTKEY_LABEL);
        CFRunLoopRun();
    });
}

#[cfg(target_os = "windows")]
pub fn start_hotkey_listener(flag: Arc<AtomicBool>) {
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::Input::KeyboardAndMouse::{RegisterHotKey, MOD_CONTROL, MOD_NOREPEAT, MOD_SHIFT};
    use windows::Win32::UI::WindowsAndMessaging::{GetMessageW, MSG, WM_HOTKEY};

    const VK_P: u32 = 0x50;
    const HOTKEY_ID: i32 = 1;

    std::thread::spawn(move || unsafe {
        if RegisterHotKey(HWND::default(), HOTKEY_ID, MOD_CONTROL | MOD_SHIFT | MOD_NOREPEAT, VK_P).is_err() {
            tracing::error!(target: "hotkey", "failed to register {}; another application may own it", HOTKEY_LABEL);
            return;
        }
        tracing::info!(target: "hotkey", "global hotkey {} toggles pause", HOTKEY_LABEL);
        let mut msg = MSG::default();
        while GetMessageW(&mut msg, HWND::default(), 0, 0).0 > 0 {
            if msg.message == WM_HOTKEY && msg.wParam.0 == HOTKEY_ID as usize {
                flag.store(true, Ordering::Release);
            }
        }
    });
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn start_hotkey_listener(_flag: Arc<AtomicBool>) {
    tracing::debug!(target: "hotkey", "global hotkeys are not supported on this platform");
}
