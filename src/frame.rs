// Frame loop: update -> acquire -> submit -> present
//
// The loop only knows the `FrameTarget` seam, so the recreation rules can be
// exercised without a GPU. Stale swapchains are recovered here; everything
// else the target reports is fatal and propagates to the caller.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{AcquireOutcome, PresentOutcome};

/// Shared "keep running" switch owned by the application shell
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Submitting,
    Presenting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Nothing rendered: stopped or nothing to draw into
    Skipped,
    Presented,
    /// Presented, then the swapchain was rebuilt
    Recreated,
    /// Acquire found the swapchain out of date; rebuilt without drawing
    Abandoned,
}

/// Something that can render and present one frame
pub trait FrameTarget {
    /// False while there is nothing to present to (e.g. a minimised window)
    fn can_render(&self) -> bool {
        true
    }

    /// Refresh per-frame data; `elapsed` is measured from loop start
    fn update(&mut self, elapsed: Duration) -> Result<()>;

    fn acquire(&mut self) -> Result<AcquireOutcome>;

    fn submit(&mut self, image_index: u32) -> Result<()>;

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome>;

    fn recreate_swapchain(&mut self) -> Result<()>;
}

pub struct FrameLoop {
    state: FrameState,
    running: RunFlag,
    started: Instant,
    frames: u64,
}

impl FrameLoop {
    pub fn new(running: RunFlag) -> Self {
        Self {
            state: FrameState::Idle,
            running,
            started: Instant::now(),
            frames: 0,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Frames presented so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn running(&self) -> &RunFlag {
        &self.running
    }

    /// Run one frame against `target`
    pub fn tick<T: FrameTarget + ?Sized>(&mut self, target: &mut T) -> Result<FrameOutcome> {
        if !self.running.is_running() || !target.can_render() {
            return Ok(FrameOutcome::Skipped);
        }

        let outcome = self.run_frame(target);
        let failed_in = self.state;
        self.state = FrameState::Idle;

        outcome.with_context(|| format!("Frame {} failed while {:?}", self.frames, failed_in))
    }

    fn run_frame<T: FrameTarget + ?Sized>(&mut self, target: &mut T) -> Result<FrameOutcome> {
        target.update(self.started.elapsed())?;

        self.state = FrameState::Acquiring;
        let (image_index, suboptimal) = match target.acquire()? {
            AcquireOutcome::Ready { image_index, suboptimal } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, abandoning frame");
                target.recreate_swapchain()?;
                return Ok(FrameOutcome::Abandoned);
            }
        };

        self.state = FrameState::Submitting;
        target.submit(image_index)?;

        self.state = FrameState::Presenting;
        let presented = target.present(image_index)?;
        self.frames += 1;

        if presented == PresentOutcome::Stale || suboptimal {
            log::debug!("Swapchain stale after present, recreating");
            target.recreate_swapchain()?;
            return Ok(FrameOutcome::Recreated);
        }

        Ok(FrameOutcome::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RendererError;
    use ash::vk;

    #[derive(Default)]
    struct MockTarget {
        calls: Vec<&'static str>,
        acquire: Vec<AcquireOutcome>,
        present: Option<PresentOutcome>,
        fail_submit: bool,
        fail_present: bool,
        minimized: bool,
    }

    impl MockTarget {
        fn ready() -> Self {
            Self {
                acquire: vec![AcquireOutcome::Ready { image_index: 2, suboptimal: false }],
                present: Some(PresentOutcome::Presented),
                ..Default::default()
            }
        }
    }

    impl FrameTarget for MockTarget {
        fn can_render(&self) -> bool {
            !self.minimized
        }

        fn update(&mut self, _elapsed: Duration) -> Result<()> {
            self.calls.push("update");
            Ok(())
        }

        fn acquire(&mut self) -> Result<AcquireOutcome> {
            self.calls.push("acquire");
            Ok(self.acquire.remove(0))
        }

        fn submit(&mut self, image_index: u32) -> Result<()> {
            self.calls.push("submit");
            assert_eq!(image_index, 2);
            if self.fail_submit {
                return Err(RendererError::Frame {
                    stage: "submit",
                    result: vk::Result::ERROR_DEVICE_LOST,
                }
                .into());
            }
            Ok(())
        }

        fn present(&mut self, _image_index: u32) -> Result<PresentOutcome> {
            self.calls.push("present");
            if self.fail_present {
                return Err(RendererError::Frame {
                    stage: "present",
                    result: vk::Result::ERROR_SURFACE_LOST_KHR,
                }
                .into());
            }
            Ok(self.present.unwrap_or(PresentOutcome::Presented))
        }

        fn recreate_swapchain(&mut self) -> Result<()> {
            self.calls.push("recreate");
            Ok(())
        }
    }

    #[test]
    fn healthy_frame_runs_every_stage_in_order() {
        let mut frame_loop = FrameLoop::new(RunFlag::new());
        let mut target = MockTarget::ready();

        assert_eq!(frame_loop.tick(&mut target).unwrap(), FrameOutcome::Presented);
        assert_eq!(target.calls, vec!["update", "acquire", "submit", "present"]);
        assert_eq!(frame_loop.frames(), 1);
        assert_eq!(frame_loop.state(), FrameState::Idle);
    }

    #[test]
    fn out_of_date_acquire_recreates_and_abandons_the_frame() {
        let running = RunFlag::new();
        let mut frame_loop = FrameLoop::new(running.clone());
        let mut target = MockTarget {
            acquire: vec![AcquireOutcome::OutOfDate],
            ..Default::default()
        };

        assert_eq!(frame_loop.tick(&mut target).unwrap(), FrameOutcome::Abandoned);
        assert_eq!(target.calls, vec!["update", "acquire", "recreate"]);
        assert!(running.is_running());
        assert_eq!(frame_loop.frames(), 0);
    }

    #[test]
    fn suboptimal_present_recreates_after_presenting() {
        let mut frame_loop = FrameLoop::new(RunFlag::new());
        let mut target = MockTarget {
            present: Some(PresentOutcome::Stale),
            ..MockTarget::ready()
        };

        assert_eq!(frame_loop.tick(&mut target).unwrap(), FrameOutcome::Recreated);
        assert_eq!(target.calls, vec!["update", "acquire", "submit", "present", "recreate"]);
    }

    #[test]
    fn suboptimal_acquire_still_draws_then_recreates() {
        let mut frame_loop = FrameLoop::new(RunFlag::new());
        let mut target = MockTarget {
            acquire: vec![AcquireOutcome::Ready { image_index: 2, suboptimal: true }],
            ..MockTarget::ready()
        };

        assert_eq!(frame_loop.tick(&mut target).unwrap(), FrameOutcome::Recreated);
        assert_eq!(target.calls, vec!["update", "acquire", "submit", "present", "recreate"]);
    }

    #[test]
    fn submit_failure_is_fatal_and_skips_present() {
        let mut frame_loop = FrameLoop::new(RunFlag::new());
        let mut target = MockTarget {
            fail_submit: true,
            ..MockTarget::ready()
        };

        let err = frame_loop.tick(&mut target).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendererError>(),
            Some(RendererError::Frame { stage: "submit", .. })
        ));
        assert!(format!("{:#}", err).contains("Submitting"));
        assert_eq!(target.calls, vec!["update", "acquire", "submit"]);
        assert_eq!(frame_loop.state(), FrameState::Idle);
    }

    #[test]
    fn present_failure_is_fatal_and_does_not_recreate() {
        let mut frame_loop = FrameLoop::new(RunFlag::new());
        let mut target = MockTarget {
            fail_present: true,
            ..MockTarget::ready()
        };

        assert!(frame_loop.tick(&mut target).is_err());
        assert!(!target.calls.contains(&"recreate"));
    }

    #[test]
    fn stopped_flag_skips_without_touching_the_target() {
        let running = RunFlag::new();
        let mut frame_loop = FrameLoop::new(running.clone());
        let mut target = MockTarget::ready();

        running.stop();
        assert_eq!(frame_loop.tick(&mut target).unwrap(), FrameOutcome::Skipped);
        assert!(target.calls.is_empty());
        assert!(!frame_loop.running().is_running());
    }

    #[test]
    fn minimised_target_is_skipped() {
        let mut frame_loop = FrameLoop::new(RunFlag::new());
        let mut target = MockTarget {
            minimized: true,
            ..MockTarget::ready()
        };

        assert_eq!(frame_loop.tick(&mut target).unwrap(), FrameOutcome::Skipped);
        assert!(target.calls.is_empty());
    }
}
