//! Traffic Light State Machine
//!
//! This example demonstrates a simple cyclic state machine.
//!
//! Key concepts:
//! - Flat states under the root
//! - One event type driving every transition
//! - Entry listeners observing the active state
//!
//! Run with: cargo run --example traffic_light

use canopy::{machine::listener, Event, MachineBuilder, StateSpec, TransitionSpec};

#[derive(Debug)]
struct TimerEvent;
impl Event for TimerEvent {}

fn main() -> Result<(), canopy::MachineError> {
    println!("=== Traffic Light State Machine ===\n");

    let machine = MachineBuilder::new().named("traffic-light").build();
    let red = machine.add_state(machine.root(), StateSpec::plain().named("red"))?;
    let green = machine.add_state(machine.root(), StateSpec::plain().named("green"))?;
    let yellow = machine.add_state(machine.root(), StateSpec::plain().named("yellow"))?;
    machine.set_initial_state(machine.root(), red)?;
    machine.add_transition(red, TransitionSpec::on::<TimerEvent>().to(green))?;
    machine.add_transition(green, TransitionSpec::on::<TimerEvent>().to(yellow))?;
    machine.add_transition(yellow, TransitionSpec::on::<TimerEvent>().to(red))?;

    for state in [red, green, yellow] {
        machine.add_state_listener(
            state,
            listener::on_entry(|m, s, _| {
                println!("light is now {}", m.state_name(s).unwrap_or_default());
            }),
        )?;
    }

    machine.start()?;
    println!();
    for tick in 1..=6 {
        println!("tick {tick}:");
        machine.process_event(TimerEvent)?;
    }

    println!("\nThe sequence repeats: red -> green -> yellow -> red -> ...");
    println!("\n=== Example Complete ===");
    Ok(())
}
