//! libusb asynchronous transfer transport
//!
//! rusb only wraps synchronous transfers, so this module drives libusb's
//! asynchronous API through `rusb::ffi`. Each slot owns one
//! `libusb_transfer`; completion callbacks fire inside
//! `Context::handle_events` on the driver thread and only copy the outcome
//! into a session-local queue. The engine processes that queue after
//! `handle_events` returns.

use crate::config::{RunConfig, TransferType};
use crate::error::TransportError;
use crate::slot::{SlotId, TransferSlot};
use crate::transport::{Completion, PacketOutcome, TransferSession, TransferStatus, Transport};
use rusb::{Context, DeviceHandle, UsbContext, ffi};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::{c_int, c_uint, c_void};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

// libusb_transfer_type values
const TRANSFER_TYPE_ISOCHRONOUS: u8 = 1;
const TRANSFER_TYPE_BULK: u8 = 2;
const TRANSFER_TYPE_INTERRUPT: u8 = 3;

type CompletionQueue = Rc<RefCell<VecDeque<Completion>>>;

/// Transport over an opened libusb device handle
///
/// The interface holding the endpoint must already be claimed (see
/// [`crate::device::OpenDevice::locate_endpoint`]).
pub struct UsbTransport {
    context: Context,
    handle: Arc<DeviceHandle<Context>>,
}

impl UsbTransport {
    pub fn new(context: Context, handle: Arc<DeviceHandle<Context>>) -> Self {
        Self { context, handle }
    }
}

impl Transport for UsbTransport {
    type Session = LibusbSession;

    fn open_session(&self, config: &RunConfig) -> Result<Self::Session, TransportError> {
        debug!(
            "Opening libusb session for endpoint {:#04x} ({})",
            config.endpoint, config.transfer_type
        );
        Ok(LibusbSession {
            context: self.context.clone(),
            handle: self.handle.clone(),
            completed: Rc::new(RefCell::new(VecDeque::new())),
        })
    }
}

/// Per-run libusb session, confined to the driver thread
pub struct LibusbSession {
    context: Context,
    handle: Arc<DeviceHandle<Context>>,
    completed: CompletionQueue,
}

/// State reachable from the completion callback through `user_data`
struct Cookie {
    slot: SlotId,
    in_flight: Cell<bool>,
    completed: CompletionQueue,
}

/// One `libusb_transfer` plus its callback cookie
pub struct LibusbTransfer {
    transfer: NonNull<ffi::libusb_transfer>,
    cookie: NonNull<Cookie>,
    iso_capacity: usize,
}

impl LibusbTransfer {
    fn cookie(&self) -> &Cookie {
        // SAFETY: the cookie is leaked from a Box in `alloc_handle` and only
        // reclaimed in `Drop`, so it outlives every borrow of `self`.
        unsafe { self.cookie.as_ref() }
    }
}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        if self.cookie().in_flight.get() {
            // libusb still owns the transfer and will call back into it.
            // Leaking is the only sound option left.
            warn!(
                "Transfer for slot {} dropped while in flight; cancelling and leaking it",
                self.cookie().slot
            );
            // SAFETY: the transfer was allocated by libusb_alloc_transfer and
            // never freed.
            unsafe {
                ffi::libusb_cancel_transfer(self.transfer.as_ptr());
            }
            return;
        }

        // SAFETY: the transfer is not in flight, so libusb holds no reference
        // to it or to the cookie.
        unsafe {
            ffi::libusb_free_transfer(self.transfer.as_ptr());
            drop(Box::from_raw(self.cookie.as_ptr()));
        }
    }
}

impl TransferSession for LibusbSession {
    type Handle = LibusbTransfer;

    fn alloc_handle(
        &mut self,
        slot: SlotId,
        iso_packets: usize,
    ) -> Result<Self::Handle, TransportError> {
        let packets = c_int::try_from(iso_packets).map_err(|_| TransportError::InvalidParam)?;

        // SAFETY: plain allocation call, the result is checked for null.
        let raw = unsafe { ffi::libusb_alloc_transfer(packets) };
        let transfer = NonNull::new(raw).ok_or(TransportError::NoMem)?;

        let cookie = Box::new(Cookie {
            slot,
            in_flight: Cell::new(false),
            completed: self.completed.clone(),
        });

        Ok(LibusbTransfer {
            transfer,
            cookie: NonNull::from(Box::leak(cookie)),
            iso_capacity: iso_packets,
        })
    }

    fn submit(&mut self, slot: &mut TransferSlot<Self::Handle>) -> Result<(), TransportError> {
        let (descriptor, buffer, handle) = slot.parts_mut();
        let handle = handle.ok_or(TransportError::InvalidParam)?;

        if descriptor.length > buffer.len() || descriptor.iso_packets.len() > handle.iso_capacity {
            return Err(TransportError::InvalidParam);
        }
        let length = c_int::try_from(descriptor.length).map_err(|_| TransportError::InvalidParam)?;
        let num_iso_packets = c_int::try_from(descriptor.iso_packets.len())
            .map_err(|_| TransportError::InvalidParam)?;
        let timeout = c_uint::try_from(descriptor.timeout.as_millis()).unwrap_or(c_uint::MAX);

        let transfer = handle.transfer.as_ptr();

        // SAFETY: `transfer` is a live allocation with room for
        // `iso_capacity` packet descriptors, checked above. The buffer stays
        // allocated and unmoved until the completion is delivered because the
        // slot pool never touches submitted slots.
        unsafe {
            (*transfer).dev_handle = self.handle.as_raw();
            (*transfer).flags = 0;
            (*transfer).endpoint = descriptor.endpoint;
            (*transfer).transfer_type = transfer_type_code(descriptor.transfer_type);
            (*transfer).timeout = timeout;
            (*transfer).status = 0;
            (*transfer).buffer = buffer.as_mut_ptr();
            (*transfer).length = length;
            (*transfer).actual_length = 0;
            (*transfer).callback = transfer_callback;
            (*transfer).user_data = handle.cookie.as_ptr().cast::<c_void>();
            (*transfer).num_iso_packets = num_iso_packets;

            for (index, packet) in descriptor.iso_packets.iter().enumerate() {
                let desc = iso_packet(transfer, index);
                (*desc).length = c_uint::try_from(packet.length).unwrap_or(c_uint::MAX);
                (*desc).actual_length = 0;
            }
        }

        // SAFETY: the transfer is fully initialised above.
        let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
        if rc != 0 {
            return Err(TransportError::from_libusb_code(rc));
        }

        handle.cookie().in_flight.set(true);
        Ok(())
    }

    fn wait_for_completions(
        &mut self,
        timeout: Duration,
        completed: &mut Vec<Completion>,
    ) -> Result<(), TransportError> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => return Err(e.into()),
        }

        completed.extend(self.completed.borrow_mut().drain(..));
        Ok(())
    }
}

/// Pointer to the `index`th isochronous packet descriptor of a transfer
///
/// # Safety
/// `transfer` must have been allocated with more than `index` packets.
unsafe fn iso_packet(
    transfer: *mut ffi::libusb_transfer,
    index: usize,
) -> *mut ffi::libusb_iso_packet_descriptor {
    // SAFETY: guaranteed by the caller.
    unsafe {
        std::ptr::addr_of_mut!((*transfer).iso_packet_desc)
            .cast::<ffi::libusb_iso_packet_descriptor>()
            .add(index)
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back a transfer submitted by `submit`, whose
    // user_data points at the cookie owned by the same LibusbTransfer.
    unsafe {
        let cookie = &*((*transfer).user_data as *const Cookie);
        cookie.in_flight.set(false);

        let status = map_transfer_status((*transfer).status);
        let packet_count = usize::try_from((*transfer).num_iso_packets).unwrap_or(0);

        let completion = if packet_count == 0 {
            let actual = usize::try_from((*transfer).actual_length).unwrap_or(0);
            Completion::new(cookie.slot, status, actual)
        } else {
            let packets = (0..packet_count)
                .map(|index| {
                    let desc = &*iso_packet(transfer, index);
                    PacketOutcome {
                        status: map_transfer_status(desc.status as c_int),
                        actual_length: desc.actual_length as usize,
                    }
                })
                .collect();
            Completion::isochronous(cookie.slot, status, packets)
        };

        match cookie.completed.try_borrow_mut() {
            Ok(mut queue) => queue.push_back(completion),
            Err(_) => error!(
                "Completion queue busy, dropping completion for slot {}",
                cookie.slot
            ),
        }
    }
}

fn transfer_type_code(transfer_type: TransferType) -> u8 {
    match transfer_type {
        TransferType::Bulk => TRANSFER_TYPE_BULK,
        TransferType::Interrupt => TRANSFER_TYPE_INTERRUPT,
        TransferType::Isochronous => TRANSFER_TYPE_ISOCHRONOUS,
    }
}

/// Map a `libusb_transfer_status` value
fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        0 => TransferStatus::Completed,
        2 => TransferStatus::TimedOut,
        3 => TransferStatus::Cancelled,
        4 => TransferStatus::Stall,
        5 => TransferStatus::NoDevice,
        6 => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_status() {
        assert_eq!(map_transfer_status(0), TransferStatus::Completed);
        assert_eq!(map_transfer_status(1), TransferStatus::Error);
        assert_eq!(map_transfer_status(2), TransferStatus::TimedOut);
        assert_eq!(map_transfer_status(3), TransferStatus::Cancelled);
        assert_eq!(map_transfer_status(4), TransferStatus::Stall);
        assert_eq!(map_transfer_status(5), TransferStatus::NoDevice);
        assert_eq!(map_transfer_status(6), TransferStatus::Overflow);
        assert_eq!(map_transfer_status(42), TransferStatus::Error);
    }

    #[test]
    fn test_transfer_type_code() {
        assert_eq!(transfer_type_code(TransferType::Isochronous), 1);
        assert_eq!(transfer_type_code(TransferType::Bulk), 2);
        assert_eq!(transfer_type_code(TransferType::Interrupt), 3);
    }

    #[test]
    fn test_alloc_and_free_transfer() {
        // Allocation needs libusb but no device; skip quietly where libusb
        // cannot be initialised.
        let context = match Context::new() {
            Ok(context) => context,
            Err(e) => {
                eprintln!("libusb unavailable (expected in some sandboxes): {}", e);
                return;
            }
        };
        let queue: CompletionQueue = Rc::new(RefCell::new(VecDeque::new()));

        // SAFETY: allocation only, freed by LibusbTransfer::drop.
        let raw = unsafe { ffi::libusb_alloc_transfer(4) };
        let transfer = LibusbTransfer {
            transfer: NonNull::new(raw).expect("libusb_alloc_transfer returned null"),
            cookie: NonNull::from(Box::leak(Box::new(Cookie {
                slot: SlotId(0),
                in_flight: Cell::new(false),
                completed: queue,
            }))),
            iso_capacity: 4,
        };
        assert_eq!(transfer.cookie().slot, SlotId(0));
        drop(transfer);
        drop(context);
    }
}
