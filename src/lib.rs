#![doc = include_str!("../README.md")]
#![cfg_attr(feature = "document-features", doc = "## feature flags")]
#![cfg_attr(feature = "document-features", doc = document_features::document_features!())]
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use bevy_app::prelude::*;
use bevy_ecs::schedule::IntoScheduleConfigs;

pub mod array;
pub mod graph;
pub mod signal;
#[allow(missing_docs)]
pub mod utils;

/// Includes the systems required for [shoal](crate) to function.
#[derive(Default)]
pub struct ShoalPlugin;

impl Plugin for ShoalPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(
            Last,
            (
                array::flush_array_replays,
                graph::process_signal_graph,
                graph::flush_cleanup_signals,
                array::flush_orphaned_processors,
                array::despawn_stale_mutable_arrays,
            )
                .chain(),
        );
    }
}

/// `use shoal::prelude::*;` imports everything one needs to start using [shoal](crate).
pub mod prelude {
    pub use crate::{
        ShoalPlugin,
        array::{ArraySignalExt, MutableArray},
        graph::{SignalHandle, SignalHandles},
        signal::{Signal, SignalBuilder, SignalExt},
        utils::{LazyEntity, clone},
    };
}
