// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! The application connection: progress, tile updates and abort
//! polling. The renderer invokes every callback from a single thread
//! in sequential order, so implementors only guard their own state.

use helios_data::geom::{Color, Rect};
use helios_data::{HostId, Tag};
use helios_runtime::db::Database;

/// Message severities of `print`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

pub trait Connection: Send + Sync {
    fn print(&self, severity: Severity, message: &str) {
        let _ = (severity, message);
    }

    /// Completion callback; returning false aborts the render.
    fn progress(&self, percent: f32) -> bool {
        let _ = percent;
        true
    }

    /// A bucket was handed to a host and is about to render.
    fn clear_tile(&self, rect: Rect, host: HostId) {
        let _ = (rect, host);
    }

    /// A bucket finished; its pixels are merged in the frame buffer.
    fn update_tile(&self, db: &Database, color_fb: Tag, opacity_fb: Tag, rect: Rect) {
        let _ = (db, color_fb, opacity_fb, rect);
    }

    fn draw_pixel(&self, x: i32, y: i32, color: Color) {
        let _ = (x, y, color);
    }

    fn update_sub_window(&self, rect: Rect) {
        let _ = rect;
    }
}

/// Default connection: log lines, never aborts.
pub struct ConsoleConnection;

impl Connection for ConsoleConnection {
    fn print(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => tracing::debug!("{message}"),
            Severity::Info => tracing::info!("{message}"),
            Severity::Warning => tracing::warn!("{message}"),
            Severity::Error => tracing::error!("{message}"),
        }
    }

    fn progress(&self, percent: f32) -> bool {
        tracing::debug!(percent, "render progress");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_callbacks_are_permissive() {
        let conn = ConsoleConnection;
        assert!(conn.progress(50.0));
        conn.print(Severity::Info, "tile done");
        conn.clear_tile(Rect::new(0, 8, 0, 8), 0);
    }
}
