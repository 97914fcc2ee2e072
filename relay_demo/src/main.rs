use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use relay_core::{BoundedChannel, Select, SelectEvent};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Relay demo options
#[derive(Parser)]
struct Opts {
    /// Delay in milliseconds before the faster select sender fires; the
    /// slower one takes twice as long
    #[arg(long, default_value = "50")]
    stagger_ms: u64,

    /// Rounds used by the select fairness tally
    #[arg(long, default_value = "1000")]
    fairness_rounds: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();

    rendezvous_scene()?;
    buffered_scene()?;
    close_and_drain_scene()?;
    select_scene(opts.stagger_ms)?;
    fairness_scene(opts.fairness_rounds)?;

    Ok(())
}

/// An unbuffered channel: the spawned sender and the main receiver meet in
/// a rendezvous, so the value is observed exactly once.
fn rendezvous_scene() -> Result<()> {
    info!("scene 1: rendezvous over an unbuffered channel");

    let ch = Arc::new(BoundedChannel::new(0));
    let sender = {
        let ch = ch.clone();
        thread::spawn(move || ch.send(42))
    };

    if let Some(value) = ch.recv() {
        println!("{}", value);
    }
    sender.join().expect("sender thread panicked")?;
    Ok(())
}

/// A capacity-2 channel holds both values without any receiver present.
fn buffered_scene() -> Result<()> {
    info!("scene 2: buffered channel with capacity 2");

    let ch = BoundedChannel::new(2);
    ch.send(1)?;
    ch.send(2)?;

    if let Some(value) = ch.recv() {
        println!("{}", value);
    }
    if let Some(value) = ch.recv() {
        println!("{}", value);
    }
    Ok(())
}

/// Sender pushes three values and closes; the receive loop drains them and
/// terminates cleanly at end-of-stream.
fn close_and_drain_scene() -> Result<()> {
    info!("scene 3: close, drain and iterate");

    let ch = Arc::new(BoundedChannel::new(0));
    let sender = {
        let ch = ch.clone();
        thread::spawn(move || -> Result<()> {
            for i in 1..=3 {
                ch.send(i)?;
            }
            ch.close()?;
            Ok(())
        })
    };

    for value in ch.iter() {
        println!("{}", value);
    }
    sender.join().expect("sender thread panicked")?;
    Ok(())
}

/// Two channels race; the select completes whichever handoff is ready
/// first. The stagger makes the outcome deterministic for display.
fn select_scene(stagger_ms: u64) -> Result<()> {
    info!("scene 4: select over two staggered channels");

    let fast = Arc::new(BoundedChannel::new(0));
    let slow = Arc::new(BoundedChannel::new(0));

    let fast_sender = {
        let fast = fast.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(stagger_ms));
            fast.send(String::from("Hello"))
        })
    };
    let slow_sender = {
        let slow = slow.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(stagger_ms * 2));
            slow.send(String::from("World"))
        })
    };

    let mut select = Select::new();
    let fast_index = select.recv(&fast);
    select.recv(&slow);

    let selected = select.wait();
    if let SelectEvent::Received(message) = &selected.event {
        println!("Received: {}", message);
    }

    // Nobody selects the losing channel again; take its value directly so
    // that sender can finish its rendezvous.
    if selected.index == fast_index {
        slow.recv();
    } else {
        fast.recv();
    }
    fast_sender.join().expect("fast sender panicked")?;
    slow_sender.join().expect("slow sender panicked")?;
    Ok(())
}

/// Staggered timers never exercise fairness, so this scene keeps both
/// channels ready on every round and tallies which side the select picks.
fn fairness_scene(rounds: usize) -> Result<()> {
    info!("scene 5: select fairness tally over {} rounds", rounds);

    let left = BoundedChannel::new(1);
    let right = BoundedChannel::new(1);
    let mut tally = [0usize; 2];

    for _ in 0..rounds {
        let _ = left.try_send("left");
        let _ = right.try_send("right");

        let mut select = Select::new();
        select.recv(&left);
        select.recv(&right);
        tally[select.wait().index] += 1;
    }

    println!("left: {}  right: {}", tally[0], tally[1]);
    Ok(())
}
