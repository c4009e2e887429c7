//! Screen region capture (C1).
//!
//! `GdiCapturer` is the one supported backend (`capture.backend = "GDI"`);
//! other values are rejected at construction per the design spec. Platform
//! handles are kept thread-local so grabs issued from different threads
//! never share device-context state, mirroring how the teacher keeps its
//! WASAPI COM apartment scoped per capture thread.

pub mod audio;
pub mod recorder;

use crate::error::CaptureError;

/// Immutable capture rectangle in physical virtual-desktop pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.x + (self.width as i32) / 2,
            self.y + (self.height as i32) / 2,
        )
    }
}

/// A (H, W, 4) BGRA byte buffer, transient for the duration of one tick.
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major, 4 bytes per pixel, B G R A.
    pub data: Vec<u8>,
}

impl Frame {
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * self.width + x) * 4) as usize;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2], self.data[idx + 3]]
    }
}

/// Capability set: `grab` + a per-thread cleanup hook (§9 design notes:
/// "polymorphism over the capability set {grab(Region)->Frame,
/// release_thread_resources()}").
pub trait Capturer: Send + Sync {
    fn grab(&self, region: Region) -> Result<Frame, CaptureError>;
    fn release_thread_resources(&self);
}

/// Construct the one supported backend, failing at construction for any
/// other configured name.
pub fn build_capturer(backend: &str) -> Result<Box<dyn Capturer>, CaptureError> {
    if backend.to_uppercase() != "GDI" {
        return Err(CaptureError::UnsupportedBackend(backend.to_string()));
    }
    Ok(Box::new(platform::GdiCapturer::new()))
}

/// Clamp a requested rectangle to the virtual desktop bounds and enforce
/// width/height >= 1.
pub fn clamp_to_desktop(region: Region, desktop: Region) -> Result<Region, CaptureError> {
    let x0 = region.x.max(desktop.x);
    let y0 = region.y.max(desktop.y);
    let x1 = (region.x + region.width as i32).min(desktop.x + desktop.width as i32);
    let y1 = (region.y + region.height as i32).min(desktop.y + desktop.height as i32);

    if x1 <= x0 || y1 <= y0 {
        return Err(CaptureError::EmptyRegion);
    }

    Ok(Region::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32))
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::cell::RefCell;
    use windows::Win32::Foundation::HWND;
    use windows::Win32::Graphics::Gdi::{
        BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC,
        GetDIBits, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS,
        HBITMAP, HDC, SRCCOPY,
    };

    struct ThreadLocalDc {
        screen_dc: HDC,
        mem_dc: HDC,
    }

    thread_local! {
        static TLS: RefCell<Option<ThreadLocalDc>> = RefCell::new(None);
    }

    pub struct GdiCapturer;

    impl GdiCapturer {
        pub fn new() -> Self {
            GdiCapturer
        }

        fn with_dc<R>(&self, f: impl FnOnce(HDC, HDC) -> R) -> R {
            TLS.with(|cell| {
                let mut slot = cell.borrow_mut();
                if slot.is_none() {
                    let screen_dc = unsafe { GetDC(HWND(0)) };
                    let mem_dc = unsafe { CreateCompatibleDC(screen_dc) };
                    *slot = Some(ThreadLocalDc { screen_dc, mem_dc });
                }
                let dcs = slot.as_ref().unwrap();
                f(dcs.screen_dc, dcs.mem_dc)
            })
        }
    }

    impl Capturer for GdiCapturer {
        fn grab(&self, region: Region) -> Result<Frame, CaptureError> {
            if region.width == 0 || region.height == 0 {
                return Err(CaptureError::EmptyRegion);
            }

            self.with_dc(|screen_dc, mem_dc| unsafe {
                let bitmap: HBITMAP =
                    CreateCompatibleBitmap(screen_dc, region.width as i32, region.height as i32);
                let old = SelectObject(mem_dc, bitmap);

                let ok = BitBlt(
                    mem_dc,
                    0,
                    0,
                    region.width as i32,
                    region.height as i32,
                    screen_dc,
                    region.x,
                    region.y,
                    SRCCOPY,
                );
                if ok.is_err() {
                    SelectObject(mem_dc, old);
                    let _ = DeleteObject(bitmap);
                    return Err(CaptureError::Platform("BitBlt failed".to_string()));
                }

                let mut info = BITMAPINFO {
                    bmiHeader: BITMAPINFOHEADER {
                        biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                        biWidth: region.width as i32,
                        biHeight: -(region.height as i32),
                        biPlanes: 1,
                        biBitCount: 32,
                        biCompression: BI_RGB.0,
                        ..Default::default()
                    },
                    ..Default::default()
                };

                let mut data = vec![0u8; (region.width * region.height * 4) as usize];
                let scanlines = GetDIBits(
                    mem_dc,
                    bitmap,
                    0,
                    region.height,
                    Some(data.as_mut_ptr() as *mut _),
                    &mut info,
                    DIB_RGB_COLORS,
                );

                SelectObject(mem_dc, old);
                let _ = DeleteObject(bitmap);

                if scanlines == 0 {
                    return Err(CaptureError::Platform("GetDIBits failed".to_string()));
                }

                Ok(Frame {
                    width: region.width,
                    height: region.height,
                    data,
                })
            })
        }

        fn release_thread_resources(&self) {
            TLS.with(|cell| {
                if let Some(dcs) = cell.borrow_mut().take() {
                    unsafe {
                        let _ = DeleteDC(dcs.mem_dc);
                        ReleaseDC(HWND(0), dcs.screen_dc);
                    }
                }
            });
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use super::*;

    pub struct GdiCapturer;

    impl GdiCapturer {
        pub fn new() -> Self {
            GdiCapturer
        }
    }

    impl Capturer for GdiCapturer {
        fn grab(&self, _region: Region) -> Result<Frame, CaptureError> {
            Err(CaptureError::UnsupportedPlatform)
        }

        fn release_thread_resources(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_backend() {
        let err = build_capturer("MSS").err().unwrap();
        assert!(matches!(err, CaptureError::UnsupportedBackend(_)));
    }

    #[test]
    fn accepts_gdi_backend_case_insensitively() {
        assert!(build_capturer("gdi").is_ok());
    }

    #[test]
    fn clamp_shrinks_to_desktop_bounds() {
        let desktop = Region::new(0, 0, 1920, 1080);
        let requested = Region::new(-100, -50, 2200, 1200);
        let clamped = clamp_to_desktop(requested, desktop).unwrap();
        assert_eq!(clamped, Region::new(0, 0, 1920, 1080));
    }

    #[test]
    fn clamp_rejects_region_fully_outside_desktop() {
        let desktop = Region::new(0, 0, 1920, 1080);
        let requested = Region::new(5000, 5000, 100, 100);
        assert!(matches!(
            clamp_to_desktop(requested, desktop),
            Err(CaptureError::EmptyRegion)
        ));
    }
}
