use std::{
    alloc::{self, Layout},
    ffi::{c_int, c_uint, c_void},
    ptr::{self, NonNull},
    slice,
};

use rustix::io::Errno;

use crate::{
    transfer::{Direction, EndpointType, Urb, UrbKind, SETUP_PACKET_SIZE},
    Error, ErrorKind, UrbStatus,
};

use super::{
    urb_status,
    usbfs::{
        IsoPacketDesc, RawUrb, USBDEVFS_URB_BULK_CONTINUATION, USBDEVFS_URB_ISO_ASAP,
        USBDEVFS_URB_SHORT_NOT_OK, USBDEVFS_URB_TYPE_BULK, USBDEVFS_URB_TYPE_CONTROL,
        USBDEVFS_URB_TYPE_INTERRUPT, USBDEVFS_URB_TYPE_ISO, USBDEVFS_URB_ZERO_PACKET,
    },
};

/// Largest buffer usbfs accepts in a single URB without tuning
/// `usbfs_memory_mb`.
pub const DEFAULT_MAX_FRAGMENT_LEN: usize = 16 * 1024;

/// usbfs rejects isochronous URBs with more packets than this.
pub const ISO_MAX_PACKETS: usize = 128;

/// The kernel wants a non-null buffer even for zero-length transfers.
const MIN_BUFFER_LEN: usize = 1;

/// One usbfs URB: the header (with its trailing isochronous packet
/// descriptors) and the data buffer it points to.
///
/// Both live in their own heap allocations, so moving a `Fragment` does not
/// move the memory the kernel sees. Whoever owns the `Fragment` owns that
/// memory; while the kernel holds the URB, the `Fragment` is kept in the
/// engine's pending index and nothing else can reach it.
pub(crate) struct Fragment {
    urb: NonNull<RawUrb>,
    num_packets: usize,
    buffer: Vec<u8>,

    /// Offset of this fragment's payload within the request buffer.
    offset: usize,

    /// Index of the first isochronous packet of the request carried here.
    first_packet: usize,
}

unsafe impl Send for Fragment {}
unsafe impl Sync for Fragment {}

fn header_layout(num_packets: usize) -> Result<Layout, Error> {
    let capacity = || Error::new(ErrorKind::Capacity, "too many isochronous packets");
    let descs = Layout::array::<IsoPacketDesc>(num_packets).map_err(|_| capacity())?;
    let (layout, _) = Layout::new::<RawUrb>()
        .extend(descs)
        .map_err(|_| capacity())?;
    Ok(layout.pad_to_align())
}

impl Fragment {
    fn new(
        ep_type: u8,
        endpoint: u8,
        flags: c_uint,
        buffer: Vec<u8>,
        request_len: usize,
        packets: &[u32],
    ) -> Result<Fragment, Error> {
        debug_assert!(buffer.len() >= request_len.max(MIN_BUFFER_LEN));
        let buffer_length: c_int = request_len
            .try_into()
            .map_err(|_| Error::new(ErrorKind::Capacity, "fragment length overflow"))?;

        let layout = header_layout(packets.len())?;
        // SAFETY: the layout is never zero-sized, it contains a `RawUrb`.
        let raw = unsafe { alloc::alloc_zeroed(layout) } as *mut RawUrb;
        let Some(urb) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };

        // SAFETY: freshly allocated with room for the header and `packets.len()`
        // descriptors.
        unsafe {
            ptr::write(
                urb.as_ptr(),
                RawUrb {
                    ep_type,
                    endpoint,
                    status: -Errno::INPROGRESS.raw_os_error(),
                    flags,
                    // Filled in by `arm` once the fragment is about to be submitted.
                    buffer: ptr::null_mut(),
                    buffer_length,
                    actual_length: 0,
                    start_frame: 0,
                    number_of_packets_or_stream_id: packets.len() as c_uint,
                    error_count: 0,
                    signr: 0,
                    usercontext: ptr::null_mut(),
                },
            );
            let descs = urb.as_ptr().add(1) as *mut IsoPacketDesc;
            for (i, &length) in packets.iter().enumerate() {
                ptr::write(
                    descs.add(i),
                    IsoPacketDesc {
                        length,
                        actual_length: 0,
                        status: 0,
                    },
                );
            }
        }

        Ok(Fragment {
            urb,
            num_packets: packets.len(),
            buffer,
            offset: 0,
            first_packet: 0,
        })
    }

    /// Point the header at the data buffer and embed `token` as the
    /// identity the kernel hands back on reap.
    pub(crate) fn arm(&mut self, token: usize) -> *mut RawUrb {
        let buffer = self.buffer.as_mut_ptr();
        let urb = self.urb_mut();
        urb.buffer = buffer;
        urb.usercontext = token as *mut c_void;
        self.urb.as_ptr()
    }

    /// Read back the token embedded by [`arm`][Self::arm].
    ///
    /// # Safety
    ///
    /// `urb` must point to the header of a live `Fragment`.
    pub(crate) unsafe fn token_of(urb: *const RawUrb) -> usize {
        unsafe { (*urb).usercontext as usize }
    }

    #[inline]
    pub(crate) fn urb_ptr(&self) -> *mut RawUrb {
        self.urb.as_ptr()
    }

    #[inline]
    pub(crate) fn urb(&self) -> &RawUrb {
        // SAFETY: only the owner of the `Fragment` can call this, and the kernel
        // does not write to a URB it has handed back.
        unsafe { self.urb.as_ref() }
    }

    #[inline]
    fn urb_mut(&mut self) -> &mut RawUrb {
        unsafe { self.urb.as_mut() }
    }

    pub(crate) fn iso_packets(&self) -> &[IsoPacketDesc] {
        unsafe {
            slice::from_raw_parts(
                self.urb.as_ptr().add(1) as *const IsoPacketDesc,
                self.num_packets,
            )
        }
    }

    #[inline]
    pub(crate) fn request_len(&self) -> usize {
        self.urb().buffer_length as usize
    }

    #[inline]
    pub(crate) fn actual_len(&self) -> usize {
        self.urb().actual_length.max(0) as usize
    }

    #[inline]
    pub(crate) fn status(&self) -> UrbStatus {
        urb_status(self.urb().status)
    }

    #[inline]
    pub(crate) fn error_count(&self) -> u32 {
        self.urb().error_count.max(0) as u32
    }

    #[inline]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub(crate) fn first_packet(&self) -> usize {
        self.first_packet
    }

    #[cfg(any(test, fuzzing))]
    pub(crate) fn num_packets(&self) -> usize {
        self.num_packets
    }
}

impl Drop for Fragment {
    fn drop(&mut self) {
        if let Ok(layout) = header_layout(self.num_packets) {
            // SAFETY: allocated in `new` with this layout.
            unsafe { alloc::dealloc(self.urb.as_ptr() as *mut u8, layout) }
        }
    }
}

fn capacity_error(message: &'static str) -> Error {
    Error::new(ErrorKind::Capacity, message).log_debug()
}

fn native_buffer(len: usize) -> Vec<u8> {
    vec![0; len.max(MIN_BUFFER_LEN)]
}

/// Split a request into the usbfs URBs that carry it, in submission order.
///
/// No fragment is longer than `max_len` bytes, except that a control
/// fragment also carries the 8-byte setup packet. OUT payloads are copied
/// into the fragments; IN fragments start zeroed.
pub(crate) fn fragment_urb(urb: &Urb, max_len: usize) -> Result<Vec<Fragment>, Error> {
    if max_len == 0 {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            "URB size limit must not be zero",
        ));
    }
    let direction = urb.direction();
    match &urb.kind {
        UrbKind::Control(setup) => {
            let len = urb.buffer.len();
            if len > max_len || len > u16::MAX as usize {
                return Err(capacity_error("control transfer exceeds the URB size limit"));
            }

            let mut setup = *setup;
            setup.length = len as u16;

            let mut buffer = native_buffer(SETUP_PACKET_SIZE + len);
            buffer[..SETUP_PACKET_SIZE].copy_from_slice(&setup.to_bytes());
            if direction == Direction::Out {
                buffer[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + len].copy_from_slice(&urb.buffer);
            }

            let f = Fragment::new(
                USBDEVFS_URB_TYPE_CONTROL,
                urb.endpoint,
                0,
                buffer,
                SETUP_PACKET_SIZE + len,
                &[],
            )?;
            Ok(vec![f])
        }
        UrbKind::Bulk | UrbKind::Interrupt => {
            let ep_type = match urb.endpoint_type() {
                EndpointType::Bulk => USBDEVFS_URB_TYPE_BULK,
                _ => USBDEVFS_URB_TYPE_INTERRUPT,
            };
            let total = urb.buffer.len();
            let count = total.div_ceil(max_len).max(1);

            let mut fragments = Vec::with_capacity(count);
            for i in 0..count {
                let offset = i * max_len;
                let len = max_len.min(total - offset);

                let mut flags = 0;
                match direction {
                    Direction::In => {
                        if urb.flags.short_not_ok {
                            flags |= USBDEVFS_URB_SHORT_NOT_OK;
                        }
                        if i > 0 && ep_type == USBDEVFS_URB_TYPE_BULK {
                            flags |= USBDEVFS_URB_BULK_CONTINUATION;
                        }
                    }
                    Direction::Out => {
                        if urb.flags.zero_packet && i == count - 1 {
                            flags |= USBDEVFS_URB_ZERO_PACKET;
                        }
                    }
                }

                let mut buffer = native_buffer(len);
                if direction == Direction::Out {
                    buffer[..len].copy_from_slice(&urb.buffer[offset..offset + len]);
                }

                let mut f = Fragment::new(ep_type, urb.endpoint, flags, buffer, len, &[])?;
                f.offset = offset;
                fragments.push(f);
            }
            Ok(fragments)
        }
        UrbKind::Isochronous(packets) => {
            if packets.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "isochronous transfer without packets",
                ));
            }
            let total: usize = packets.iter().map(|p| p.length as usize).sum();
            if total > urb.buffer.len() {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "isochronous packets exceed the transfer buffer",
                ));
            }

            let mut fragments = Vec::new();
            let mut first = 0;
            let mut offset = 0;
            while first < packets.len() {
                let mut end = first;
                let mut len = 0;
                while end < packets.len() && end - first < ISO_MAX_PACKETS {
                    let packet_len = packets[end].length as usize;
                    if packet_len > max_len {
                        return Err(capacity_error(
                            "isochronous packet exceeds the URB size limit",
                        ));
                    }
                    if len + packet_len > max_len {
                        break;
                    }
                    len += packet_len;
                    end += 1;
                }

                let mut buffer = native_buffer(len);
                if direction == Direction::Out {
                    buffer[..len].copy_from_slice(&urb.buffer[offset..offset + len]);
                }

                let lengths: Vec<u32> = packets[first..end].iter().map(|p| p.length).collect();
                let mut f = Fragment::new(
                    USBDEVFS_URB_TYPE_ISO,
                    urb.endpoint,
                    USBDEVFS_URB_ISO_ASAP,
                    buffer,
                    len,
                    &lengths,
                )?;
                f.offset = offset;
                f.first_packet = first;
                fragments.push(f);

                offset += len;
                first = end;
            }
            Ok(fragments)
        }
    }
}

/// Check the batching invariants on an arbitrary packet list.
#[cfg(fuzzing)]
pub fn fuzz_fragment_isochronous(data: &[u8]) {
    let lengths: Vec<u32> = data
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .collect();
    let urb = Urb::isochronous(crate::UrbHandle(0), 0x81, &lengths, Vec::new());
    if let Ok(fragments) = fragment_urb(&urb, DEFAULT_MAX_FRAGMENT_LEN) {
        let mut next = 0;
        for f in &fragments {
            assert_eq!(f.first_packet(), next);
            assert!(f.request_len() <= DEFAULT_MAX_FRAGMENT_LEN);
            assert!(f.num_packets() <= ISO_MAX_PACKETS);
            next += f.num_packets();
        }
        assert_eq!(next, lengths.len());
    }
}
