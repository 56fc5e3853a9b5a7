// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Minimal binary PPM output driver for the demo render. Production
//! image formats come from output plugin modules.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use helios_data::Tag;
use helios_engine::buffer;
use helios_engine::output::OutputDriver;
use helios_runtime::db::Database;
use helios_runtime::error::Result;

pub struct PpmDriver {
    path: PathBuf,
}

impl PpmDriver {
    pub fn new<P: Into<PathBuf>>(path: P) -> PpmDriver {
        PpmDriver { path: path.into() }
    }
}

fn to_srgb_byte(v: f32) -> u8 {
    let v = v.clamp(0.0, 1.0).powf(1.0 / 2.2);
    (v * 255.0 + 0.5) as u8
}

impl OutputDriver for PpmDriver {
    fn write(
        &self,
        db: &Database,
        color_fb: Tag,
        _opacity_fb: Tag,
        _options: Tag,
        _camera: Tag,
    ) -> Result<()> {
        let (width, height) = buffer::framebuffer_size(db, color_fb)?;
        let mut out = BufWriter::new(File::create(&self.path)?);

        write!(out, "P6\n{width} {height}\n255\n")?;
        for y in 0..height {
            for x in 0..width {
                let px = buffer::read_pixel(db, color_fb, x, y)?;
                out.write_all(&[
                    to_srgb_byte(px[0]),
                    to_srgb_byte(px[1]),
                    to_srgb_byte(px[2]),
                ])?;
            }
        }
        out.flush()?;
        Ok(())
    }
}
