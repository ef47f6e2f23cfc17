// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;

use image::RgbImage;
use log::debug;

use crate::display::ButtonSnapshot;

/// The seven logical buttons of the control pad.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Button {
    A,
    B,
    Left,
    Right,
    Up,
    Down,
    Center,
}

const BUTTON_COUNT: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonPhase {
    /// Rising edge.
    Press,
    /// Still down on a subsequent poll; fires repeatedly while held.
    Hold,
    /// Falling edge.
    Release,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: Button,
    pub phase: ButtonPhase,
}

/// Edge detector over raw button snapshots. Reset on every screen
/// transition so stale state never leaks into the next screen's bindings.
pub struct InputMap {
    pressed: [bool; BUTTON_COUNT],
}

impl Default for InputMap {
    fn default() -> Self {
        Self::new()
    }
}

impl InputMap {
    pub fn new() -> Self {
        InputMap { pressed: [false; BUTTON_COUNT] }
    }

    pub fn reset(&mut self) {
        self.pressed = [false; BUTTON_COUNT];
    }

    /// Converts a raw snapshot into press/hold/release events, in a fixed
    /// button order.
    pub fn update(&mut self, snapshot: &ButtonSnapshot) -> Vec<ButtonEvent> {
        let states = [
            (Button::A, snapshot.a),
            (Button::B, snapshot.b),
            (Button::Left, snapshot.left),
            (Button::Right, snapshot.right),
            (Button::Up, snapshot.up),
            (Button::Down, snapshot.down),
            (Button::Center, snapshot.center),
        ];
        let mut events = Vec::new();
        for (index, (button, down)) in states.into_iter().enumerate() {
            let was_down = self.pressed[index];
            match (was_down, down) {
                (false, true) => events
                    .push(ButtonEvent { button, phase: ButtonPhase::Press }),
                (true, true) => events
                    .push(ButtonEvent { button, phase: ButtonPhase::Hold }),
                (true, false) => events.push(ButtonEvent {
                    button,
                    phase: ButtonPhase::Release,
                }),
                (false, false) => {}
            }
            self.pressed[index] = down;
        }
        events
    }
}

/// The finite screen set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScreenState {
    MainMenu,
    Focus,
    Alignment,
    TargetList,
    TargetSelect,
    Navigation,
    Directions,
    Info,
}

/// One screen of the UI: owns its input bindings (the `handle` match) and a
/// render function over the context it captured at construction.
pub trait Screen: Send {
    /// Called when the screen becomes current; refresh any cached state.
    fn enter(&mut self) {}

    /// Reacts to one button event, possibly requesting a transition.
    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState>;

    fn render(&mut self) -> RgbImage;
}

/// Current screen plus the installed input bindings. Transitions reset the
/// input map and call the new screen's enter() before any further event is
/// processed; buttons still held across a transition stay swallowed until
/// released.
pub struct UiState {
    current: ScreenState,
    screens: HashMap<ScreenState, Box<dyn Screen>>,
    input: InputMap,
    waiting_for_release: bool,
}

impl UiState {
    pub fn new(
        mut screens: HashMap<ScreenState, Box<dyn Screen>>,
        initial: ScreenState,
    ) -> Self {
        if let Some(screen) = screens.get_mut(&initial) {
            screen.enter();
        }
        UiState {
            current: initial,
            screens,
            input: InputMap::new(),
            waiting_for_release: false,
        }
    }

    pub fn current(&self) -> ScreenState {
        self.current
    }

    pub fn transition(&mut self, next: ScreenState) {
        debug!("screen {:?} -> {:?}", self.current, next);
        self.input.reset();
        self.waiting_for_release = true;
        self.current = next;
        if let Some(screen) = self.screens.get_mut(&next) {
            screen.enter();
        }
    }

    /// Feeds one poll of the button pad through the current screen's
    /// bindings.
    pub fn handle_buttons(&mut self, snapshot: &ButtonSnapshot) {
        if self.waiting_for_release {
            if *snapshot == ButtonSnapshot::default() {
                self.waiting_for_release = false;
            }
            return;
        }
        let events = self.input.update(snapshot);
        for event in events {
            let next = self
                .screens
                .get_mut(&self.current)
                .and_then(|screen| screen.handle(event));
            if let Some(next) = next {
                self.transition(next);
                // Remaining events belong to the old bindings; drop them.
                break;
            }
        }
    }

    pub fn render(&mut self) -> Option<RgbImage> {
        self.screens.get_mut(&self.current).map(|screen| screen.render())
    }
}
