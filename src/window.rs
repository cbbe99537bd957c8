use std::{
    cell::Cell,
    ffi::c_void,
    io::ErrorKind,
    rc::Rc,
};

use wayland_client::{
    protocol::{wl_compositor, wl_keyboard, wl_seat, wl_surface},
    Display, EventQueue, GlobalManager, Main,
};
use wayland_egl::WlEglSurface;
use wayland_protocols::xdg_shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use crate::types::error::{Nv12Error, Result};

/// Linux input event codes for Esc and Q.
const KEY_ESC: u32 = 1;
const KEY_Q: u32 = 16;

fn is_quit_key(key: u32, key_state: wl_keyboard::KeyState) -> bool {
    key_state == wl_keyboard::KeyState::Pressed && (key == KEY_ESC || key == KEY_Q)
}

#[derive(Default)]
struct WindowState {
    closed: Cell<bool>,
    configured: Cell<bool>,
    /// Size requested by the compositor, `(0, 0)` means "pick your own".
    requested_size: Cell<(i32, i32)>,
}

/// An `xdg_toplevel` surface wrapped in a `wl_egl_window` for EGL.
pub struct WaylandWindow {
    display: Display,
    event_queue: EventQueue,
    state: Rc<WindowState>,
    size: Cell<(i32, i32)>,
    // Shared with the EGL context through `native_handles`.
    egl_surface: Rc<WlEglSurface>,
    toplevel: Main<xdg_toplevel::XdgToplevel>,
    xdg_surface: Main<xdg_surface::XdgSurface>,
    _surface: Main<wl_surface::WlSurface>,
    _seat: Option<Main<wl_seat::WlSeat>>,
    _wm_base: Main<xdg_wm_base::XdgWmBase>,
}

/// Keeps a window's `wl_egl_window` and Wayland connection alive for as long
/// as EGL objects created from them exist.
pub struct NativeWindowHandles {
    egl_window: Rc<WlEglSurface>,
    display: Display,
}

impl WaylandWindow {
    pub fn new(title: &str, width: i32, height: i32) -> Result<Self> {
        let display = Display::connect_to_env()
            .map_err(|e| Nv12Error::Init(format!("Failed to connect to Wayland: {e}")))?;
        let mut event_queue = display.create_event_queue();
        let attached = (*display).clone().attach(event_queue.token());

        let globals = GlobalManager::new(&attached);
        event_queue.sync_roundtrip(&mut (), |_, _, _| {})?;

        let compositor = globals
            .instantiate_exact::<wl_compositor::WlCompositor>(1)
            .map_err(|e| Nv12Error::Init(format!("wl_compositor unavailable: {e}")))?;
        let wm_base = globals
            .instantiate_exact::<xdg_wm_base::XdgWmBase>(1)
            .map_err(|e| Nv12Error::Init(format!("xdg_wm_base unavailable: {e}")))?;

        wm_base.quick_assign(|wm_base, event, _| {
            if let xdg_wm_base::Event::Ping { serial } = event {
                wm_base.pong(serial);
            }
        });

        let state = Rc::new(WindowState::default());

        let surface = compositor.create_surface();
        let xdg_surface = wm_base.get_xdg_surface(&surface);
        {
            let state = state.clone();
            xdg_surface.quick_assign(move |xdg_surface, event, _| {
                if let xdg_surface::Event::Configure { serial } = event {
                    xdg_surface.ack_configure(serial);
                    state.configured.set(true);
                }
            });
        }

        let toplevel = xdg_surface.get_toplevel();
        toplevel.set_title(title.to_string());
        toplevel.set_app_id("nv12-gpu".to_string());
        {
            let state = state.clone();
            toplevel.quick_assign(move |_, event, _| match event {
                xdg_toplevel::Event::Close => {
                    log::info!("Window close requested");
                    state.closed.set(true);
                }
                xdg_toplevel::Event::Configure { width, height, .. } => {
                    state.requested_size.set((width, height));
                }
                _ => {}
            });
        }

        let seat = match globals.instantiate_exact::<wl_seat::WlSeat>(1) {
            Ok(seat) => {
                let state = state.clone();
                let mut keyboard_bound = false;
                seat.quick_assign(move |seat, event, _| {
                    let wl_seat::Event::Capabilities { capabilities } = event else {
                        return;
                    };
                    if keyboard_bound || !capabilities.contains(wl_seat::Capability::Keyboard) {
                        return;
                    }
                    keyboard_bound = true;
                    let state = state.clone();
                    seat.get_keyboard().quick_assign(move |_, event, _| {
                        if let wl_keyboard::Event::Key {
                            key,
                            state: key_state,
                            ..
                        } = event
                        {
                            if is_quit_key(key, key_state) {
                                log::info!("Quit key pressed");
                                state.closed.set(true);
                            }
                        }
                    });
                });
                Some(seat)
            }
            Err(e) => {
                log::debug!("No wl_seat, keyboard quit disabled: {e}");
                None
            }
        };

        surface.commit();
        while !state.configured.get() {
            event_queue.dispatch(&mut (), |_, _, _| {})?;
        }

        let egl_surface = Rc::new(WlEglSurface::new(&surface, width, height));
        log::debug!("Created {width}x{height} Wayland window \"{title}\"");

        Ok(Self {
            display,
            event_queue,
            state,
            size: Cell::new((width, height)),
            egl_surface,
            toplevel,
            xdg_surface,
            _surface: surface,
            _seat: seat,
            _wm_base: wm_base,
        })
    }

    /// Processes whatever the compositor sent without blocking.
    /// Returns `false` once the window was asked to close.
    pub fn dispatch(&mut self) -> Result<bool> {
        self.display.flush().or_else(ignore_would_block)?;

        if let Some(guard) = self.event_queue.prepare_read() {
            guard.read_events().or_else(ignore_would_block)?;
        }
        self.event_queue.dispatch_pending(&mut (), |_, _, _| {})?;

        let (width, height) = self.state.requested_size.get();
        if width > 0 && height > 0 && (width, height) != self.size.get() {
            log::debug!("Resizing window to {width}x{height}");
            self.egl_surface.resize(width, height, 0, 0);
            self.size.set((width, height));
        }

        Ok(!self.state.closed.get())
    }

    pub fn size(&self) -> (i32, i32) {
        self.size.get()
    }

    pub fn display_ptr(&self) -> khronos_egl::NativeDisplayType {
        self.display.get_display_ptr() as *mut c_void
    }

    pub fn egl_window_ptr(&self) -> khronos_egl::NativeWindowType {
        self.egl_surface.ptr() as *mut c_void
    }

    pub fn native_handles(&self) -> NativeWindowHandles {
        NativeWindowHandles {
            egl_window: Rc::clone(&self.egl_surface),
            display: self.display.clone(),
        }
    }
}

impl Drop for WaylandWindow {
    fn drop(&mut self) {
        self.toplevel.destroy();
        self.xdg_surface.destroy();
        let _ = self.display.flush();
    }
}

fn ignore_would_block(err: std::io::Error) -> std::io::Result<()> {
    if err.kind() == ErrorKind::WouldBlock {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pressing_esc_or_q_closes() {
        use wl_keyboard::KeyState;

        assert!(is_quit_key(KEY_ESC, KeyState::Pressed));
        assert!(is_quit_key(KEY_Q, KeyState::Pressed));
        assert!(!is_quit_key(KEY_Q, KeyState::Released));
        // KEY_A
        assert!(!is_quit_key(30, KeyState::Pressed));
    }

    #[test]
    fn native_handles_outlive_the_window() {
        if std::env::var_os("WAYLAND_DISPLAY").is_none() {
            return;
        }
        let Ok(window) = WaylandWindow::new("nv12-gpu test", 64, 64) else {
            return;
        };
        let handles = window.native_handles();
        let egl_window = window.egl_window_ptr();
        drop(window);

        assert_eq!(Rc::strong_count(&handles.egl_window), 1);
        assert_eq!(handles.egl_window.ptr() as *mut c_void, egl_window);
        assert!(handles.display.flush().is_ok());
    }
}
