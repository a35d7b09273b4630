// Submission-time resource state validation
//
// The ledger holds the state every image subresource is in at the end of the
// work submitted so far. Each submitted list is replayed against it; the
// ledger only advances when the whole list replays cleanly.

use std::collections::HashMap;

use anyhow::Result;

use crate::command::Command;
use crate::error::violation;
use crate::keys::ImageKey;
use crate::resource::{ImageDesc, ResourceState, Subresource};

pub(crate) type Overlay = HashMap<(ImageKey, Subresource), ResourceState>;

#[derive(Debug)]
struct TrackedImage {
    mip_count: u32,
    states: Vec<ResourceState>,
}

#[derive(Debug, Default)]
pub(crate) struct StateLedger {
    images: HashMap<ImageKey, TrackedImage>,
}

impl StateLedger {
    pub(crate) fn register_image(&mut self, key: ImageKey, desc: &ImageDesc, initial: ResourceState) {
        self.images.insert(
            key,
            TrackedImage {
                mip_count: desc.mip_count,
                states: vec![initial; desc.subresource_count() as usize],
            },
        );
    }

    pub(crate) fn forget_image(&mut self, key: ImageKey) {
        self.images.remove(&key);
    }

    pub(crate) fn state(&self, key: ImageKey, subresource: Subresource) -> Option<ResourceState> {
        let image = self.images.get(&key)?;
        image.states.get(subresource.index(image.mip_count) as usize).copied()
    }

    /// Replay `commands` and advance the ledger, or leave it untouched and
    /// report the first mismatch.
    #[cfg(test)]
    pub(crate) fn submit(&mut self, commands: &[Command]) -> Result<()> {
        let overlay = self.replay(commands)?;
        self.commit(overlay);
        Ok(())
    }

    /// Replay `commands` without touching the ledger. The returned overlay
    /// holds every subresource state the list changes.
    pub(crate) fn replay(&self, commands: &[Command]) -> Result<Overlay> {
        let mut overlay: Overlay = HashMap::new();
        let mut open_pass: Option<Vec<(ImageKey, Vec<Subresource>, ResourceState)>> = None;

        for (position, command) in commands.iter().enumerate() {
            let current = |overlay: &Overlay,
                           image: ImageKey,
                           sub: Subresource| {
                overlay.get(&(image, sub)).copied().or_else(|| self.state(image, sub))
            };
            match command {
                Command::Barrier { image, subresource, before, after, .. } => {
                    if let Some(state) = current(&overlay, *image, *subresource) {
                        if *before != ResourceState::Undefined && state != *before {
                            violation!(
                                "command {}: barrier expects mip {} layer {} in {:?} but it is in {:?}",
                                position,
                                subresource.mip,
                                subresource.layer,
                                before,
                                state
                            );
                        }
                    }
                    overlay.insert((*image, *subresource), *after);
                }
                Command::CopyBufferToImage { image, subresource, .. } => {
                    expect(position, current(&overlay, *image, *subresource), *subresource, "upload", |s| {
                        s == ResourceState::CopyDest
                    })?;
                }
                Command::CopyImageToBuffer { image, format, subresource, .. } => {
                    expect(
                        position,
                        current(&overlay, *image, *subresource),
                        *subresource,
                        "read-back",
                        |state| state.allows_copy_read(*format),
                    )?;
                }
                Command::ClearImage { image, subresources, .. } => {
                    for sub in subresources {
                        expect(position, current(&overlay, *image, *sub), *sub, "clear", |s| {
                            s == ResourceState::CopyDest
                        })?;
                    }
                }
                Command::BeginRenderPass { attachments, .. } => {
                    let mut finals = Vec::with_capacity(attachments.len());
                    for attachment in attachments {
                        for sub in &attachment.subresources {
                            if attachment.initial_state == ResourceState::Undefined {
                                continue;
                            }
                            expect(
                                position,
                                current(&overlay, attachment.image, *sub),
                                *sub,
                                "render pass attachment",
                                |s| s == attachment.initial_state,
                            )?;
                        }
                        finals.push((attachment.image, attachment.subresources.clone(), attachment.final_state));
                    }
                    open_pass = Some(finals);
                }
                Command::EndRenderPass => {
                    for (image, subresources, state) in open_pass.take().unwrap_or_default() {
                        for sub in subresources {
                            overlay.insert((image, sub), state);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(overlay)
    }

    pub(crate) fn commit(&mut self, overlay: Overlay) {
        for ((image, sub), state) in overlay {
            if let Some(tracked) = self.images.get_mut(&image) {
                let index = sub.index(tracked.mip_count) as usize;
                if let Some(slot) = tracked.states.get_mut(index) {
                    *slot = state;
                }
            }
        }
    }

    /// Presenting needs the back buffer in `Present`.
    pub(crate) fn check_present(&self, image: ImageKey) -> Result<()> {
        match self.state(image, Subresource::new(0, 0)) {
            Some(ResourceState::Present) | None => Ok(()),
            Some(state) => violation!("back buffer presented while in {:?}", state),
        }
    }
}

fn expect(
    position: usize,
    state: Option<ResourceState>,
    sub: Subresource,
    what: &str,
    accept: impl Fn(ResourceState) -> bool,
) -> Result<()> {
    match state {
        Some(state) if !accept(state) => violation!(
            "command {}: {} finds mip {} layer {} in {:?}",
            position,
            what,
            sub.mip,
            sub.layer,
            state
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::resource::{Aspect, ImageUsage};
    use slotmap::SlotMap;

    fn setup() -> (StateLedger, ImageKey) {
        let mut keys: SlotMap<ImageKey, ()> = SlotMap::with_key();
        let key = keys.insert(());
        let desc = ImageDesc {
            format: Format::R8G8B8A8Unorm,
            width: 8,
            height: 8,
            mip_count: 2,
            layer_count: 2,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            clear_value: None,
        };
        let mut ledger = StateLedger::default();
        ledger.register_image(key, &desc, ResourceState::Undefined);
        (ledger, key)
    }

    fn barrier(image: ImageKey, sub: Subresource, before: ResourceState, after: ResourceState) -> Command {
        Command::Barrier { image, subresource: sub, aspect: Aspect::Color, before, after }
    }

    #[test]
    fn ledger_tracks_each_subresource_across_submissions() {
        let (mut ledger, img) = setup();
        let sub = Subresource::new(1, 1);
        ledger
            .submit(&[barrier(img, sub, ResourceState::Undefined, ResourceState::CopyDest)])
            .unwrap();
        assert_eq!(ledger.state(img, sub), Some(ResourceState::CopyDest));
        assert_eq!(ledger.state(img, Subresource::new(0, 1)), Some(ResourceState::Undefined));

        // A later list that assumes the wrong state is refused.
        let err = ledger
            .submit(&[barrier(img, sub, ResourceState::ReadGeneric, ResourceState::CopyDest)])
            .unwrap_err();
        assert!(crate::error::classify(&err).unwrap().is_contract_violation());
        ledger
            .submit(&[barrier(img, sub, ResourceState::CopyDest, ResourceState::ReadGeneric)])
            .unwrap();
        assert_eq!(ledger.state(img, sub), Some(ResourceState::ReadGeneric));
    }

    #[test]
    fn failed_replay_leaves_ledger_untouched() {
        let (mut ledger, img) = setup();
        let a = Subresource::new(0, 0);
        let b = Subresource::new(1, 0);
        let result = ledger.submit(&[
            barrier(img, a, ResourceState::Undefined, ResourceState::CopyDest),
            barrier(img, b, ResourceState::CopySource, ResourceState::CopyDest),
        ]);
        assert!(result.is_err());
        assert_eq!(ledger.state(img, a), Some(ResourceState::Undefined));
    }

    #[test]
    fn clears_need_copy_dest() {
        let (mut ledger, img) = setup();
        let clear = Command::ClearImage {
            image: img,
            format: Format::R8G8B8A8Unorm,
            aspect: Aspect::Color,
            subresources: vec![Subresource::new(0, 0)],
            value: crate::resource::ClearValue::Color([0.0; 4]),
        };
        assert!(ledger.submit(std::slice::from_ref(&clear)).is_err());
        ledger
            .submit(&[
                barrier(img, Subresource::new(0, 0), ResourceState::Undefined, ResourceState::CopyDest),
                clear,
            ])
            .unwrap();
    }

    #[test]
    fn present_requires_present_state() {
        let (mut ledger, img) = setup();
        assert!(ledger.check_present(img).is_err());
        ledger.forget_image(img);
        ledger.check_present(img).unwrap();
    }
}
