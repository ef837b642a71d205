// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Kernel metadata queries
//!
//! Descriptors that only the kernel side knows about are fetched with a
//! request made of a fixed header followed by a variable-length record
//! trailer. The caller states in `nrecs` how many records the trailer has
//! room for. The kernel always writes back the number of records the
//! descriptor really has, and only fills the trailer when it is big
//! enough. A caller that gets back a larger count resizes the trailer to
//! exactly that count and asks again.
//!
//! On the wire (native endian) the header is
//!
//! ```text
//! u64 name_ptr | i64 varid | i32 flags | u32 id | u32 epid | u32 size | u32 nrecs | u32 pad
//! ```
//!
//! and each trailer record is
//!
//! ```text
//! u16 action | u16 pad | u32 size | u32 offset | u16 alignment | u16 format | u64 arg | u64 uarg
//! ```

use std::io::{self, Cursor};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::agg::AggregationId;
use crate::epid::EnabledProbeId;
use crate::record::{ActionKind, RecordDescriptor};

pub const AGGDESC_HEADER_SIZE: usize = 40;
pub const RECDESC_SIZE: usize = 32;

/// An in/out aggregation description request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggDescRequest {
    pub id: AggregationId,
    pub epid: EnabledProbeId,
    pub size: u32,
    pub flags: i32,
    /// Trailer capacity on the way in, real record count on the way out.
    pub nrecs: u32,
    pub recs: Vec<RecordDescriptor>,
}

impl AggDescRequest {
    /// A request for aggregation `id` with room for `nrecs` records.
    pub fn new(id: AggregationId, nrecs: usize) -> io::Result<AggDescRequest> {
        let mut recs = Vec::new();
        recs.try_reserve_exact(nrecs)
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
        recs.resize(nrecs, RecordDescriptor::default());
        Ok(AggDescRequest {
            id,
            nrecs: nrecs as u32,
            recs,
            ..Default::default()
        })
    }

    /// Number of records the trailer can hold.
    pub fn capacity(&self) -> usize {
        self.recs.len()
    }

    /// True once the trailer holds every record of the descriptor.
    pub fn is_complete(&self) -> bool {
        self.nrecs as usize <= self.capacity()
    }

    pub fn wire_size(nrecs: usize) -> usize {
        AGGDESC_HEADER_SIZE + nrecs * RECDESC_SIZE
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(Self::wire_size(self.capacity()))
            .map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;

        buf.write_u64::<NativeEndian>(0)?;
        buf.write_i64::<NativeEndian>(0)?;
        buf.write_i32::<NativeEndian>(self.flags)?;
        buf.write_u32::<NativeEndian>(self.id)?;
        buf.write_u32::<NativeEndian>(self.epid)?;
        buf.write_u32::<NativeEndian>(self.size)?;
        buf.write_u32::<NativeEndian>(self.capacity() as u32)?;
        buf.write_u32::<NativeEndian>(0)?;
        for rec in self.recs.iter() {
            buf.write_u16::<NativeEndian>(rec.action.to_raw())?;
            buf.write_u16::<NativeEndian>(0)?;
            buf.write_u32::<NativeEndian>(rec.size)?;
            buf.write_u32::<NativeEndian>(rec.offset)?;
            buf.write_u16::<NativeEndian>(rec.alignment)?;
            buf.write_u16::<NativeEndian>(rec.format)?;
            buf.write_u64::<NativeEndian>(rec.arg)?;
            buf.write_u64::<NativeEndian>(rec.uarg)?;
        }
        Ok(buf)
    }

    /// Reads a kernel response back into the request. Trailer records are
    /// only taken over when the response says they fit.
    pub fn decode(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut cursor = Cursor::new(buf);
        let _name_ptr = cursor.read_u64::<NativeEndian>()?;
        let _varid = cursor.read_i64::<NativeEndian>()?;
        self.flags = cursor.read_i32::<NativeEndian>()?;
        self.id = cursor.read_u32::<NativeEndian>()?;
        self.epid = cursor.read_u32::<NativeEndian>()?;
        self.size = cursor.read_u32::<NativeEndian>()?;
        self.nrecs = cursor.read_u32::<NativeEndian>()?;
        let _pad = cursor.read_u32::<NativeEndian>()?;

        if !self.is_complete() {
            return Ok(());
        }

        let nrecs = self.nrecs as usize;
        self.recs.truncate(nrecs);
        for rec in self.recs.iter_mut() {
            rec.action = ActionKind::from_raw(cursor.read_u16::<NativeEndian>()?);
            let _pad = cursor.read_u16::<NativeEndian>()?;
            rec.size = cursor.read_u32::<NativeEndian>()?;
            rec.offset = cursor.read_u32::<NativeEndian>()?;
            rec.alignment = cursor.read_u16::<NativeEndian>()?;
            rec.format = cursor.read_u16::<NativeEndian>()?;
            rec.arg = cursor.read_u64::<NativeEndian>()?;
            rec.uarg = cursor.read_u64::<NativeEndian>()?;
        }
        Ok(())
    }
}

/// Synchronous access to kernel-held descriptors.
pub trait KernelQuery {
    /// Performs one aggregation description round trip for `req.id`.
    fn aggregation_desc(&mut self, req: &mut AggDescRequest) -> io::Result<()>;
}

#[cfg(feature = "device")]
pub use self::device::DtraceDevice;

#[cfg(feature = "device")]
mod device {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use tracing::debug;

    use super::{AggDescRequest, KernelQuery};

    pub const DTRACE_DEVICE: &str = "/dev/dtrace/dtrace";

    const DTRACEIOC: libc::c_ulong = (b'd' as libc::c_ulong) << 8;
    const DTRACEIOC_AGGDESC: libc::c_ulong = DTRACEIOC | 15;

    /// Queries through the DTrace control device.
    #[derive(Debug)]
    pub struct DtraceDevice {
        file: File,
    }

    impl DtraceDevice {
        pub fn open() -> io::Result<DtraceDevice> {
            Self::open_path(DTRACE_DEVICE)
        }

        pub fn open_path<P: AsRef<Path>>(path: P) -> io::Result<DtraceDevice> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok(DtraceDevice { file })
        }
    }

    impl KernelQuery for DtraceDevice {
        fn aggregation_desc(&mut self, req: &mut AggDescRequest) -> io::Result<()> {
            let mut buf = req.encode()?;
            debug!(
                "AGGDESC ioctl for aggregation {} ({} bytes)",
                req.id,
                buf.len()
            );
            let ret = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    DTRACEIOC_AGGDESC as _,
                    buf.as_mut_ptr() as *mut libc::c_void,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            req.decode(&buf)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::AggKind;

    fn sample_rec(i: u32) -> RecordDescriptor {
        RecordDescriptor {
            action: ActionKind::Aggregation(AggKind::Sum),
            size: 8,
            offset: i * 8,
            alignment: 8,
            format: 0,
            arg: i as u64,
            uarg: 0x10 + i as u64,
        }
    }

    #[test]
    fn test_encoded_size() {
        let req = AggDescRequest::new(3, 1).unwrap();
        assert_eq!(req.encode().unwrap().len(), AGGDESC_HEADER_SIZE + RECDESC_SIZE);
        let req = AggDescRequest::new(3, 4).unwrap();
        assert_eq!(req.encode().unwrap().len(), AggDescRequest::wire_size(4));
    }

    #[test]
    fn test_decode_full_response() {
        let mut resp = AggDescRequest::new(7, 2).unwrap();
        resp.epid = 4;
        resp.size = 16;
        resp.recs = vec![sample_rec(0), sample_rec(1)];
        let bytes = resp.encode().unwrap();

        let mut req = AggDescRequest::new(7, 2).unwrap();
        req.decode(&bytes).unwrap();
        assert!(req.is_complete());
        assert_eq!(req.epid, 4);
        assert_eq!(req.size, 16);
        assert_eq!(req.recs, vec![sample_rec(0), sample_rec(1)]);
    }

    #[test]
    fn test_decode_reports_required_size() {
        let mut resp = AggDescRequest::new(7, 3).unwrap();
        resp.recs = vec![sample_rec(0), sample_rec(1), sample_rec(2)];
        let mut bytes = resp.encode().unwrap();
        bytes.truncate(AggDescRequest::wire_size(1));

        let mut req = AggDescRequest::new(7, 1).unwrap();
        req.decode(&bytes).unwrap();
        assert_eq!(req.nrecs, 3);
        assert!(!req.is_complete());
        assert_eq!(req.recs, vec![RecordDescriptor::default()]);
    }

    #[test]
    fn test_decode_truncated_header_fails() {
        let mut req = AggDescRequest::new(1, 1).unwrap();
        assert!(req.decode(&[0u8; 12]).is_err());
    }
}
