//! Dispatch engine
//!
//! Routes one decoded [`Event`] to the registered handlers. Error frames are
//! reported through both the top-level error branch and the receive branch,
//! so an error frame read from a receive socket reaches every error handler
//! twice. The two checks are independent on purpose: chaining them as
//! if / else-if would leave the receive-path error branch unreachable and
//! hide the drop counter carried by a receive-side error frame.

use crate::registry::Registry;
use crate::types::{ErrorNotice, Event};

/// Deliver `event` to the handlers in `registry`
pub(crate) fn dispatch(registry: &Registry, event: &Event) {
    if event.is_error {
        registry.notify_errors(&ErrorNotice::ErrorFrame(event.frame));
    }

    if !event.is_rx {
        return;
    }

    if event.dropped_frames > 0 {
        registry.notify_errors(&ErrorNotice::DroppedFrames(event.dropped_frames));
    }

    if event.is_error {
        registry.notify_errors(&ErrorNotice::ErrorFrame(event.frame));
        return;
    }

    let Some(origin) = event.origin else {
        return;
    };
    let timestamp = event.timestamp();
    for handler in registry.rx_handlers_for(origin) {
        log::trace!("dispatch: fd {} -> {}", origin, event.frame);
        handler.on_frame(&event.frame, timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ErrorHandlerRef, RxHandlerRef};
    use crate::types::{error_class, CanFrame, Timestamp, CAN_ERR_FLAG};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(&'static str, u32)>>,
        errors: Mutex<Vec<ErrorNotice>>,
    }

    fn rx_handler(recorder: &Arc<Recorder>, tag: &'static str) -> RxHandlerRef {
        let recorder = recorder.clone();
        Arc::new(move |frame: &CanFrame, _: Timestamp| {
            recorder.frames.lock().unwrap().push((tag, frame.id()));
        })
    }

    fn error_handler(recorder: &Arc<Recorder>) -> ErrorHandlerRef {
        let recorder = recorder.clone();
        Arc::new(move |notice: &ErrorNotice| {
            recorder.errors.lock().unwrap().push(notice.clone());
        })
    }

    fn rx_event(origin: i32, frame: CanFrame) -> Event {
        Event {
            is_error: frame.is_error(),
            frame,
            origin: Some(origin),
            is_rx: true,
            ..Event::default()
        }
    }

    #[test]
    fn test_rx_handlers_only_for_origin_socket() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::new();
        registry.add_rx(10, rx_handler(&recorder, "a")).unwrap();
        registry.add_rx(11, rx_handler(&recorder, "b")).unwrap();

        let frame = CanFrame::new(0x123, &[1, 2, 3, 4]).unwrap();
        dispatch(&registry, &rx_event(11, frame));

        assert_eq!(*recorder.frames.lock().unwrap(), vec![("b", 0x123)]);
    }

    #[test]
    fn test_dropped_frames_notified_once() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::new();
        registry.add_error(error_handler(&recorder)).unwrap();
        registry.add_rx(10, rx_handler(&recorder, "a")).unwrap();

        let mut event = rx_event(10, CanFrame::new(0x10, &[]).unwrap());
        event.dropped_frames = 3;
        dispatch(&registry, &event);

        assert_eq!(
            *recorder.errors.lock().unwrap(),
            vec![ErrorNotice::DroppedFrames(3)]
        );
        assert_eq!(recorder.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_error_frame_on_rx_socket_fires_both_paths() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::new();
        registry.add_error(error_handler(&recorder)).unwrap();
        registry.add_rx(10, rx_handler(&recorder, "a")).unwrap();

        let frame = CanFrame::new(CAN_ERR_FLAG | error_class::BUSOFF, &[0; 8]).unwrap();
        let mut event = rx_event(10, frame);
        event.dropped_frames = 1;
        dispatch(&registry, &event);

        let errors = recorder.errors.lock().unwrap();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0], ErrorNotice::ErrorFrame(frame));
        assert_eq!(errors[1], ErrorNotice::DroppedFrames(1));
        assert_eq!(errors[2], ErrorNotice::ErrorFrame(frame));
        assert!(recorder.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_tx_error_frame_fires_once() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::new();
        registry.add_error(error_handler(&recorder)).unwrap();

        let frame = CanFrame::new(CAN_ERR_FLAG | error_class::TX_TIMEOUT, &[]).unwrap();
        let event = Event {
            frame,
            is_error: true,
            ..Event::default()
        };
        dispatch(&registry, &event);

        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_event_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::new();
        registry.add_error(error_handler(&recorder)).unwrap();
        registry.add_rx(10, rx_handler(&recorder, "a")).unwrap();

        dispatch(&registry, &Event::default());

        assert!(recorder.errors.lock().unwrap().is_empty());
        assert!(recorder.frames.lock().unwrap().is_empty());
    }
}
