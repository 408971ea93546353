// ========================================================================================
//
//                    The channel table: an explicit channel -> bit mapping
//
// ========================================================================================
//
// Every bitmask in the engine is interpreted through exactly one of these tables. The
// bit position of a channel is its index in the list given at construction, never an
// accident of column order in some input file. A layout is identified by its version
// together with its ordered channel list, and anything built against one layout is
// checked against both before another layout reads it.

use crate::types::{BITMASK_WIDTH, ChannelId};
use ahash::AHashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelTableError {
    #[error("channel '{0}' appears more than once in the channel table")]
    Duplicate(ChannelId),
    #[error("{found} channels were given, but a bitmask holds at most {capacity}")]
    CapacityExceeded { found: usize, capacity: usize },
}

#[derive(Debug, Clone)]
pub struct ChannelTable {
    version: u32,
    channels: Arc<[ChannelId]>,
    positions: AHashMap<ChannelId, u8>,
}

impl ChannelTable {
    /// Builds the table, rejecting duplicates and any layout wider than a bitmask.
    pub fn new(
        version: u32,
        channels: impl IntoIterator<Item = ChannelId>,
    ) -> Result<Self, ChannelTableError> {
        let channels: Vec<ChannelId> = channels.into_iter().collect();
        if channels.len() > BITMASK_WIDTH {
            return Err(ChannelTableError::CapacityExceeded {
                found: channels.len(),
                capacity: BITMASK_WIDTH,
            });
        }

        let mut positions = AHashMap::with_capacity(channels.len());
        for (bit, channel) in channels.iter().enumerate() {
            // The capacity check above keeps every index below 64.
            if positions.insert(channel.clone(), bit as u8).is_some() {
                return Err(ChannelTableError::Duplicate(channel.clone()));
            }
        }

        Ok(Self {
            version,
            channels: channels.into(),
            positions,
        })
    }

    #[inline(always)]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn bit_of(&self, channel: &ChannelId) -> Option<u8> {
        self.positions.get(channel).copied()
    }

    /// The channels in bit order, shared with everything derived from this table.
    pub fn layout(&self) -> &Arc<[ChannelId]> {
        &self.channels
    }

    /// True when `channels` lists exactly this table's channels in the same order.
    pub fn has_layout(&self, channels: &[ChannelId]) -> bool {
        *self.channels == *channels
    }

    pub fn channel_at(&self, bit: u8) -> Option<&ChannelId> {
        self.channels.get(bit as usize)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channels in bit order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &ChannelId)> {
        self.channels
            .iter()
            .enumerate()
            .map(|(bit, channel)| (bit as u8, channel))
    }
}
