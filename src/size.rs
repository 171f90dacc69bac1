//! Window size for PTY devices

use serde::{Deserialize, Serialize};

/// Window size in characters and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of rows (characters)
    pub rows: u16,
    /// Number of columns (characters)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Resolve an optional column/row pair; a missing half falls back to the default
    pub fn from_parts(cols: Option<u16>, rows: Option<u16>) -> Option<Self> {
        if cols.is_none() && rows.is_none() {
            return None;
        }
        let default = Self::default();
        Some(Self::new(
            cols.unwrap_or(default.cols),
            rows.unwrap_or(default.rows),
        ))
    }

    /// Convert to libc winsize structure
    #[cfg(unix)]
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

#[cfg(unix)]
impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_default() {
        let size = WindowSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(WindowSize::from_parts(None, None), None);
        assert_eq!(
            WindowSize::from_parts(Some(120), None),
            Some(WindowSize::new(120, 24))
        );
        assert_eq!(
            WindowSize::from_parts(None, Some(40)),
            Some(WindowSize::new(80, 40))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_to_winsize() {
        let ws = WindowSize::new(132, 43).to_winsize();
        assert_eq!(ws.ws_col, 132);
        assert_eq!(ws.ws_row, 43);
        assert_eq!(WindowSize::from(ws), WindowSize::new(132, 43));
    }
}
