//! Media Player with History
//!
//! This example demonstrates a composite state with a shallow history
//! pseudo-state: powering off remembers where playback was, and powering
//! back on returns there instead of restarting from the initial child.
//!
//! Key concepts:
//! - Nested states (playing/paused inside on)
//! - A history pseudo-state as a transition target
//! - Default fallback before any exit has been recorded
//!
//! Run with: cargo run --example media_player

use canopy::{Event, MachineBuilder, StateSpec, TransitionSpec};

#[derive(Debug)]
struct PowerToggle;
impl Event for PowerToggle {}

#[derive(Debug)]
struct PlayPause;
impl Event for PlayPause {}

fn main() -> Result<(), canopy::MachineError> {
    println!("=== Media Player with History ===\n");

    let machine = MachineBuilder::new().named("media-player").build();
    let off = machine.add_state(machine.root(), StateSpec::plain().named("off"))?;
    let on = machine.add_state(machine.root(), StateSpec::plain().named("on"))?;
    let paused = machine.add_state(on, StateSpec::plain().named("paused"))?;
    let playing = machine.add_state(on, StateSpec::plain().named("playing"))?;
    let resume = machine.add_state(on, StateSpec::shallow_history().named("resume"))?;
    machine.set_initial_state(machine.root(), off)?;
    machine.set_initial_state(on, paused)?;
    machine.add_transition(off, TransitionSpec::on::<PowerToggle>().to(resume))?;
    machine.add_transition(on, TransitionSpec::on::<PowerToggle>().to(off))?;
    machine.add_transition(paused, TransitionSpec::on::<PlayPause>().to(playing))?;
    machine.add_transition(playing, TransitionSpec::on::<PlayPause>().to(paused))?;

    machine.start()?;

    let report = |label: &str| {
        let names: Vec<String> = machine
            .active_leaves()
            .into_iter()
            .filter_map(|s| machine.state_name(s))
            .collect();
        println!("{label}: active = {names:?}");
    };

    report("initial");
    machine.process_event(PowerToggle)?;
    report("power on (no history yet, default applies)");
    machine.process_event(PlayPause)?;
    report("play");
    machine.process_event(PowerToggle)?;
    report("power off");
    machine.process_event(PowerToggle)?;
    report("power on (history restores playback)");

    println!("\n=== Example Complete ===");
    Ok(())
}
