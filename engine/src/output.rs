// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Image output seam. The core hands finished frame buffers to a
//! driver; file formats are the driver's business, usually a plugin.

use helios_data::Tag;
use helios_runtime::db::Database;
use helios_runtime::error::Result;

pub trait OutputDriver: Send + Sync {
    fn write(
        &self,
        db: &Database,
        color_fb: Tag,
        opacity_fb: Tag,
        options: Tag,
        camera: Tag,
    ) -> Result<()>;
}

/// Discards the image; previews drive everything through the
/// connection callbacks instead.
pub struct NullOutput;

impl OutputDriver for NullOutput {
    fn write(
        &self,
        _db: &Database,
        _color_fb: Tag,
        _opacity_fb: Tag,
        _options: Tag,
        _camera: Tag,
    ) -> Result<()> {
        Ok(())
    }
}
