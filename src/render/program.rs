//! Shader program cache keyed by rendering features

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::core::Result;
use crate::volume::PassMode;
use super::backend::{DrawParams, Filter};
use super::transfer::{MaskMode, RenderMode};

/// Feature tuple that selects a compiled program
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderKey {
    /// Bricks sampled together in one draw
    pub channels: u8,
    pub shading: bool,
    pub fog: bool,
    /// Bit 0: near depth bound, bit 1: far depth bound
    pub peel: u8,
    pub clip: bool,
    pub linear: bool,
    pub mask: MaskMode,
    pub colormap: bool,
    pub pass: PassMode,
    pub mode: RenderMode,
}

impl ShaderKey {
    /// Key for a draw of `channels` bricks with the given state
    pub fn for_draw(params: &DrawParams, channels: usize, filter: Filter, colormap: bool) -> Self {
        let peel = params.peel.map_or(0, |w| u8::from(w.near.is_some()) | (u8::from(w.far.is_some()) << 1));
        Self {
            channels: channels.min(u8::MAX as usize) as u8,
            shading: params.shading.is_some(),
            fog: params.fog.is_some(),
            peel,
            clip: !params.clip.is_empty(),
            linear: filter == Filter::Linear,
            mask: params.mask_mode,
            colormap,
            pass: params.pass,
            mode: params.mode,
        }
    }
}

/// Compile-once cache of programs
///
/// Compilation has no effect on streaming state; a failed compile is not cached.
pub struct ProgramCache<P> {
    programs: HashMap<ShaderKey, P>,
    compiles: u64,
}

impl<P> ProgramCache<P> {
    pub fn new() -> Self {
        Self {
            programs: HashMap::new(),
            compiles: 0,
        }
    }

    /// Return the cached program for `key`, compiling it on first use
    pub fn get_or_compile(&mut self, key: ShaderKey, compile: impl FnOnce(&ShaderKey) -> Result<P>) -> Result<&P> {
        match self.programs.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let program = compile(&key)?;
                self.compiles += 1;
                log::debug!("Compiled program #{} for {:?}", self.compiles, key);
                Ok(entry.insert(program))
            }
        }
    }

    pub fn get(&self, key: &ShaderKey) -> Option<&P> {
        self.programs.get(key)
    }

    /// Number of compilations performed
    pub fn compiles(&self) -> u64 {
        self.compiles
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn clear(&mut self) {
        self.programs.clear();
    }
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        Self::new()
    }
}
