//! # Firmware Update Feature
//!
//! Manifest retrieval and block-wise image transfer. This is the only feature
//! usable while the reader's protocol versions are incompatible, since an
//! update is how that gets fixed.
//!
//! ## Transfer
//!
//! ```text
//!  send_data ──► Begin{header, len, table}
//!                      │
//!                Ready{resume_from} ──► Block[resume_from]
//!                                            │
//!                      BlockAck[i] ──► on_progress ──► Block[i+1] ... last ack
//!                                                                     │
//!                                              Result ──► on_result ◄─┘
//! ```
//!
//! Exactly one block is in flight at a time.

use std::cell::{Cell, RefCell};

use cardreader_shared::msgs::firmware_update::{
    FirmwareUpdateEvent, FirmwareUpdateRequest, FwupResult, VersionInfo, FWUP_BLOCK_SIZE,
    MAX_BLOCK_INDEX_TABLE, MAX_FWUP_HEADER,
};
use cardreader_shared::{AppMessage, EndpointId, Message};
use heapless::Vec as HVec;
use log::{debug, info, warn};
use thiserror::Error;

use super::{FeatureSlot, FeatureState};
use crate::error::{feature_error_conversions, CardreaderError, LifecycleError};
use crate::lifecycle::Lifecycle;
use crate::reader::{Cardreader, CoreLink};
use crate::registry::EndpointHandler;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareUpdateError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("call unexpected in current state")]
    CallUnexpected,
    #[error("session error: {0}")]
    Session(#[from] CardreaderError),
    #[error("reentrant call from inside a callback")]
    Reentrant,
}

feature_error_conversions!(FirmwareUpdateError);

pub trait FirmwareUpdateEvents {
    /// `manifest` is empty when the reader has none to offer
    fn on_receive_manifest(&mut self, manifest: &[u8], required_update: bool);
    /// Percentage of the image acknowledged so far
    fn on_progress(&mut self, _percent: u8) {}
    fn on_result(&mut self, result: FwupResult);
    fn on_version_info(&mut self, _versions: &[VersionInfo]) {}
    fn on_tms_country(&mut self, _country: &str) {}
}

#[derive(Debug)]
enum Transfer {
    Idle,
    AwaitingReady { image: Vec<u8> },
    Sending { image: Vec<u8>, in_flight: u32 },
    AwaitingResult,
    Stopping,
}

fn block_count(len: usize) -> u32 {
    len.div_ceil(FWUP_BLOCK_SIZE) as u32
}

fn block_of(image: &[u8], index: u32) -> Option<HVec<u8, FWUP_BLOCK_SIZE>> {
    let start = index as usize * FWUP_BLOCK_SIZE;
    let end = (start + FWUP_BLOCK_SIZE).min(image.len());
    image.get(start..end).and_then(|chunk| HVec::from_slice(chunk).ok())
}

pub(crate) struct FirmwareUpdateState {
    link: CoreLink,
    events: RefCell<Box<dyn FirmwareUpdateEvents>>,
    manifest_pending: Cell<bool>,
    transfer: RefCell<Transfer>,
}

impl FirmwareUpdateState {
    fn send_block(&self, image: Vec<u8>, index: u32) {
        let Some(data) = block_of(&image, index) else {
            self.abort("block index past end of image");
            return;
        };
        debug!("fwup block {index} ({} bytes)", data.len());
        match self.link.send(&FirmwareUpdateRequest::Block { index, data }) {
            Ok(()) => {
                *self.transfer.borrow_mut() = Transfer::Sending {
                    image,
                    in_flight: index,
                }
            }
            Err(err) => self.abort(&format!("block send failed: {err}")),
        }
    }

    fn abort(&self, why: &str) {
        *self.transfer.borrow_mut() = Transfer::Idle;
        self.link.report_error(EndpointId::FIRMWARE_UPDATE, why);
        self.events.borrow_mut().on_result(FwupResult::Error);
    }

    fn on_ready(&self, resume_from: u32) {
        let state = std::mem::replace(&mut *self.transfer.borrow_mut(), Transfer::Idle);
        let image = match state {
            Transfer::AwaitingReady { image } => image,
            other => {
                *self.transfer.borrow_mut() = other;
                self.link
                    .reader_error(EndpointId::FIRMWARE_UPDATE, "unexpected fwup ready");
                return;
            }
        };
        let total = block_count(image.len());
        if resume_from >= total {
            info!("reader already holds all {total} blocks");
            *self.transfer.borrow_mut() = Transfer::AwaitingResult;
            self.events.borrow_mut().on_progress(100);
            return;
        }
        info!("fwup ready; sending {} of {total} blocks", total - resume_from);
        self.send_block(image, resume_from);
    }

    fn on_block_ack(&self, index: u32) {
        let state = std::mem::replace(&mut *self.transfer.borrow_mut(), Transfer::Idle);
        let image = match state {
            Transfer::Sending { image, in_flight } if in_flight == index => image,
            other => {
                *self.transfer.borrow_mut() = other;
                self.link.reader_error(
                    EndpointId::FIRMWARE_UPDATE,
                    &format!("unexpected fwup block ack {index}"),
                );
                return;
            }
        };

        let total = block_count(image.len());
        let percent = ((u64::from(index) + 1) * 100 / u64::from(total)) as u8;
        let next = index + 1;
        if next < total {
            self.events.borrow_mut().on_progress(percent);
            self.send_block(image, next);
        } else {
            *self.transfer.borrow_mut() = Transfer::AwaitingResult;
            self.events.borrow_mut().on_progress(percent);
        }
    }

    fn on_transfer_result(&self, result: FwupResult) {
        let previous = std::mem::replace(&mut *self.transfer.borrow_mut(), Transfer::Idle);
        if matches!(previous, Transfer::Idle) {
            self.link
                .reader_error(EndpointId::FIRMWARE_UPDATE, "unexpected fwup result");
            return;
        }
        info!("fwup finished: {result:?}");
        self.events.borrow_mut().on_result(result);
    }
}

impl EndpointHandler for FirmwareUpdateState {
    fn on_message(&self, msg: &Message) {
        let event = match FirmwareUpdateEvent::from_message(msg) {
            Ok(event) => event,
            Err(err) => {
                warn!("undecodable fwup message {:#06x}: {err:?}", msg.msg_type);
                self.link
                    .reader_error(EndpointId::FIRMWARE_UPDATE, "malformed firmware update message");
                return;
            }
        };

        match event {
            FirmwareUpdateEvent::Manifest {
                manifest,
                required_update,
            } => {
                if !self.manifest_pending.replace(false) {
                    self.link
                        .reader_error(EndpointId::FIRMWARE_UPDATE, "unexpected manifest");
                    return;
                }
                self.events
                    .borrow_mut()
                    .on_receive_manifest(&manifest, required_update);
            }
            FirmwareUpdateEvent::VersionInfo(versions) => {
                self.events.borrow_mut().on_version_info(&versions)
            }
            FirmwareUpdateEvent::TmsCountry(country) => {
                self.events.borrow_mut().on_tms_country(&country)
            }
            FirmwareUpdateEvent::Ready { resume_from } => self.on_ready(resume_from),
            FirmwareUpdateEvent::BlockAck { index } => self.on_block_ack(index),
            FirmwareUpdateEvent::Result(result) => self.on_transfer_result(result),
        }
    }

    fn on_link_down(&self) {
        self.manifest_pending.set(false);
        let previous = std::mem::replace(&mut *self.transfer.borrow_mut(), Transfer::Idle);
        if !matches!(previous, Transfer::Idle) {
            info!("link lost mid-transfer; transfer dropped");
        }
    }
}

impl FeatureState for FirmwareUpdateState {
    type Error = FirmwareUpdateError;
    const NAME: &'static str = "firmware_update";
    const ENDPOINTS: &'static [EndpointId] = &[EndpointId::FIRMWARE_UPDATE];
}

pub struct FirmwareUpdate {
    slot: FeatureSlot<FirmwareUpdateState>,
}

impl FirmwareUpdate {
    pub fn alloc() -> Self {
        Self {
            slot: FeatureSlot::new(),
        }
    }

    pub fn init(
        &mut self,
        reader: &Cardreader,
        events: Box<dyn FirmwareUpdateEvents>,
    ) -> Result<(), FirmwareUpdateError> {
        self.slot.init(reader, |link| FirmwareUpdateState {
            link,
            events: RefCell::new(events),
            manifest_pending: Cell::new(false),
            transfer: RefCell::new(Transfer::Idle),
        })
    }

    pub fn term(&mut self) -> Result<(), FirmwareUpdateError> {
        self.slot.term()
    }

    pub fn free(&mut self) -> Result<(), FirmwareUpdateError> {
        self.slot.free()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.slot.lifecycle()
    }

    pub fn get_manifest(&self) -> Result<(), FirmwareUpdateError> {
        let (_scope, bound) = self.slot.enter("fwup_get_manifest")?;
        if bound.state.manifest_pending.get() {
            return Err(FirmwareUpdateError::CallUnexpected);
        }
        bound.link.send(&FirmwareUpdateRequest::GetManifest)?;
        bound.state.manifest_pending.set(true);
        Ok(())
    }

    /// Start transferring an image; progress and the verdict arrive as events
    pub fn send_data(
        &self,
        header: &[u8],
        data: &[u8],
        block_index_table: &[u8],
    ) -> Result<(), FirmwareUpdateError> {
        let (_scope, bound) = self.slot.enter("fwup_send_data")?;
        if !matches!(*bound.state.transfer.borrow(), Transfer::Idle) {
            return Err(FirmwareUpdateError::CallUnexpected);
        }
        if data.is_empty() || u32::try_from(data.len()).is_err() {
            return Err(FirmwareUpdateError::InvalidParameter);
        }
        let header: HVec<u8, MAX_FWUP_HEADER> =
            HVec::from_slice(header).map_err(|_| FirmwareUpdateError::InvalidParameter)?;
        let block_index_table: HVec<u8, MAX_BLOCK_INDEX_TABLE> =
            HVec::from_slice(block_index_table)
                .map_err(|_| FirmwareUpdateError::InvalidParameter)?;

        bound.link.send(&FirmwareUpdateRequest::Begin {
            header,
            total_len: data.len() as u32,
            block_index_table,
        })?;
        info!(
            "fwup transfer started: {} bytes in {} blocks",
            data.len(),
            block_count(data.len())
        );
        *bound.state.transfer.borrow_mut() = Transfer::AwaitingReady {
            image: data.to_vec(),
        };
        Ok(())
    }

    /// Abort an active transfer; the reader still reports a final result
    pub fn stop_sending_data(&self) -> Result<(), FirmwareUpdateError> {
        let (_scope, bound) = self.slot.enter("fwup_stop_sending_data")?;
        if matches!(
            *bound.state.transfer.borrow(),
            Transfer::Idle | Transfer::Stopping
        ) {
            return Err(FirmwareUpdateError::CallUnexpected);
        }
        bound.link.send(&FirmwareUpdateRequest::Stop)?;
        *bound.state.transfer.borrow_mut() = Transfer::Stopping;
        Ok(())
    }
}
