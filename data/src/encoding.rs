// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

use std::io::{self, Read, Write};

use crate::message::payload::{
    AllocateTag, CreateData, CreateThreads, DataGenerated, DataInfo, DeleteData, FlushData,
    Generic, HostAllocated, HostAuthorized, IsAborted, JobFinished, Link, ProcessJob, SendData,
    SetScene, StepProgress, TagAllocated, ThreadCreated,
};
use crate::Serializable;

impl Serializable for HostAllocated {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.checksum.to_le_bytes())?;
        w.write_all(&self.host.to_le_bytes())?;
        w.write_all(&self.mgr_endian.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let checksum = Self::read_u32_le(r)?;
        let host = Self::read_u32_le(r)?;
        let mgr_endian = Self::read_u32_le(r)?;
        Ok(HostAllocated {
            checksum,
            host,
            mgr_endian,
        })
    }
}

impl Serializable for HostAuthorized {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.checksum.to_le_bytes())?;
        w.write_all(&self.result.to_le_bytes())?;
        w.write_all(&self.need_byteswap.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let checksum = Self::read_u32_le(r)?;
        let result = Self::read_i32_le(r)?;
        let need_byteswap = Self::read_u32_le(r)?;
        Ok(HostAuthorized {
            checksum,
            result,
            need_byteswap,
        })
    }
}

impl Serializable for CreateThreads {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.count.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(CreateThreads {
            count: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for ThreadCreated {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.num_threads.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(ThreadCreated {
            num_threads: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for Link {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        Self::write_var_le_bytes32(w, self.module.as_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let bytes = Self::read_var_le_bytes32(r)?;
        let module = String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "module name not utf-8"))?;
        Ok(Link { module })
    }
}

impl Serializable for SetScene {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.scene.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(SetScene {
            scene: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for AllocateTag {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.host.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(AllocateTag {
            host: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for TagAllocated {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.tag.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(TagAllocated {
            tag: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for ProcessJob {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.job.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(ProcessJob {
            job: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for JobFinished {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.result.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(JobFinished {
            result: Self::read_i32_le(r)?,
        })
    }
}

impl Serializable for CreateData {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.type_code.to_le_bytes())?;
        w.write_all(&self.size.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.tag.to_le_bytes())?;
        w.write_all(&self.host.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let type_code = Self::read_u32_le(r)?;
        let size = Self::read_u32_le(r)?;
        let flags = Self::read_u32_le(r)?;
        let tag = Self::read_u32_le(r)?;
        let host = Self::read_u32_le(r)?;
        Ok(CreateData {
            type_code,
            size,
            flags,
            tag,
            host,
        })
    }
}

impl Serializable for DataGenerated {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.data.to_le_bytes())?;
        w.write_all(&self.host.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let data = Self::read_u32_le(r)?;
        let host = Self::read_u32_le(r)?;
        Ok(DataGenerated { data, host })
    }
}

impl Serializable for DeleteData {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.data.to_le_bytes())?;
        w.write_all(&self.host.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let data = Self::read_u32_le(r)?;
        let host = Self::read_u32_le(r)?;
        Ok(DeleteData { data, host })
    }
}

impl Serializable for SendData {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.data.to_le_bytes())?;
        w.write_all(&self.defer_init.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let data = Self::read_u32_le(r)?;
        let defer_init = Self::read_u32_le(r)?;
        Ok(SendData { data, defer_init })
    }
}

impl Serializable for DataInfo {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.size.to_le_bytes())?;
        w.write_all(&self.inited.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let size = Self::read_u32_le(r)?;
        let inited = Self::read_u32_le(r)?;
        Ok(DataInfo { size, inited })
    }
}

impl Serializable for FlushData {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.data.to_le_bytes())?;
        w.write_all(&self.host.to_le_bytes())?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let data = Self::read_u32_le(r)?;
        let host = Self::read_u32_le(r)?;
        Ok(FlushData { data, host })
    }
}

impl Serializable for IsAborted {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.abort.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(IsAborted {
            abort: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for StepProgress {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.count.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(StepProgress {
            count: Self::read_u32_le(r)?,
        })
    }
}

impl Serializable for Generic {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.result.to_le_bytes())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Generic {
            result: Self::read_i32_le(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    /// Asserts if encoding/decoding of a serializable type runs properly.
    fn assert_serializable<S: Eq + Serializable + std::fmt::Debug>(obj: S) {
        let mut buf = vec![];
        obj.write(&mut buf).expect("should be writable");

        assert_eq!(
            obj,
            S::read(&mut &buf[..]).expect("should be readable")
        );
    }

    #[test]
    fn test_encoding_handshake() {
        assert_serializable(HostAllocated {
            checksum: crate::message::PROTOCOL_CHECKSUM,
            host: 3,
            mgr_endian: 0,
        });
        assert_serializable(HostAuthorized {
            checksum: crate::message::reply_checksum(crate::message::PROTOCOL_CHECKSUM),
            result: 0,
            need_byteswap: 1,
        });
    }

    #[test]
    fn test_encoding_link() {
        assert_serializable(Link {
            module: "shaders.standard".into(),
        });
    }

    #[test]
    fn test_encoding_create_data() {
        assert_serializable(CreateData {
            type_code: 7,
            size: 4096,
            flags: 3,
            tag: 0xDEAD,
            host: 2,
        });
    }

    #[test]
    fn test_encoding_messages() {
        assert_serializable(Message::Disconnect);
        assert_serializable(Message::CheckAbort);
        assert_serializable(Message::new_process_job(42));
        assert_serializable(Message::new_job_finished(-1));
        assert_serializable(Message::new_tag_allocated(0x0102_0304));
        assert_serializable(Message::new_send_data(9, true));
        assert_serializable(Message::new_is_aborted(false));
        assert_serializable(Message::Link(Link {
            module: "exr_output".into(),
        }));
        assert_serializable(Message::DataInfo(DataInfo {
            size: 1 << 20,
            inited: 1,
        }));
    }

    #[test]
    fn test_unknown_code_rejected() {
        let buf = 0x7777_7777u32.to_le_bytes();
        assert!(Message::read(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_wire_is_little_endian() {
        let mut buf = vec![];
        Message::new_process_job(0x0102_0304)
            .write(&mut buf)
            .unwrap();
        // code 8, then the job tag, both little-endian
        assert_eq!(buf, vec![8, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);
    }
}
