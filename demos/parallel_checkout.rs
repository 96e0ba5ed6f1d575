//! Parallel Checkout
//!
//! This example demonstrates parallel regions and finish propagation:
//! payment and shipping progress independently, the composite finishes
//! once both regions have reached their final states, and the synthesized
//! finished event drives an ordinary transition to the completed state.
//!
//! Key concepts:
//! - A parallel composite with two regions
//! - Final marker states finishing each region
//! - A FinishedEvent matching a transition elsewhere in the tree
//!
//! Run with: cargo run --example parallel_checkout

use canopy::{machine::listener, Event, FinishedEvent, MachineBuilder, StateSpec, TransitionSpec};

#[derive(Debug)]
struct PaymentCaptured;
impl Event for PaymentCaptured {}

#[derive(Debug)]
struct ParcelShipped;
impl Event for ParcelShipped {}

fn main() -> Result<(), canopy::MachineError> {
    println!("=== Parallel Checkout ===\n");

    let machine = MachineBuilder::new().named("checkout").build();
    let processing = machine.add_state(
        machine.root(),
        StateSpec::parallel().named("processing"),
    )?;
    let payment = machine.add_state(processing, StateSpec::plain().named("payment"))?;
    let shipping = machine.add_state(processing, StateSpec::plain().named("shipping"))?;
    let authorizing = machine.add_state(payment, StateSpec::plain().named("authorizing"))?;
    let captured = machine.add_state(payment, StateSpec::final_state().named("captured"))?;
    let packing = machine.add_state(shipping, StateSpec::plain().named("packing"))?;
    let shipped = machine.add_state(shipping, StateSpec::final_state().named("shipped"))?;
    let completed = machine.add_state(machine.root(), StateSpec::plain().named("completed"))?;

    machine.set_initial_state(machine.root(), processing)?;
    machine.set_initial_state(payment, authorizing)?;
    machine.set_initial_state(shipping, packing)?;
    machine.add_transition(
        authorizing,
        TransitionSpec::on::<PaymentCaptured>().to(captured),
    )?;
    machine.add_transition(packing, TransitionSpec::on::<ParcelShipped>().to(shipped))?;
    machine.add_transition(
        machine.root(),
        TransitionSpec::on::<FinishedEvent>()
            .guard(move |ctx| {
                ctx.event_as::<FinishedEvent>()
                    .is_some_and(|f| f.state() == processing)
            })
            .to(completed),
    )?;

    machine.add_state_listener(
        processing,
        listener::on_finished(|m, s, _| {
            println!("-> {} finished (all regions done)", m.state_name(s).unwrap_or_default());
        }),
    )?;
    machine.add_state_listener(
        completed,
        listener::on_entry(|_, _, _| println!("-> order completed")),
    )?;

    machine.start()?;
    println!("processing started; both regions active");

    machine.process_event(PaymentCaptured)?;
    println!(
        "payment captured; order finished yet: {}",
        machine.is_finished(processing)
    );

    machine.process_event(ParcelShipped)?;
    println!("completed active: {}", machine.is_active(completed));

    println!("\n=== Example Complete ===");
    Ok(())
}
