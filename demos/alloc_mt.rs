use std::sync::atomic::{AtomicBool, Ordering};

use tgc::{Config, Gc, Heap, Trace, Visitor};

pub struct Node {
    value: i64,
    next: Gc<Node>,
}

unsafe impl Trace for Node {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_handle(&self.next);
    }
}

fn main() {
    let heap = Heap::new(Config {
        verbose: true,
        ..Config::default()
    })
    .expect("default budget is non-zero");
    let done = AtomicBool::new(false);

    println!("Spawning 4 mutators");
    let start = std::time::Instant::now();
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut swept = 0;
            while !done.load(Ordering::Relaxed) {
                swept += heap.collect_step();
            }
            println!("Collector thread swept {} objects", swept);
        });

        let mutators: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let list: Gc<Node> = heap.empty();
                    for i in 0..200_000 {
                        let node = heap.allocate(Node {
                            value: 42,
                            next: list.clone(),
                        });
                        list.set(&node);

                        if i % 8192 == 0 {
                            list.reset();
                        }
                    }
                    list.get().map_or(0, |node| node.value)
                })
            })
            .collect();
        for mutator in mutators {
            mutator.join().expect("mutator panicked");
        }
        done.store(true, Ordering::Relaxed);
    });

    println!("Mutators finished in {:.2}ms", start.elapsed().as_micros() as f64 / 1000.0);
    println!("{}", heap.statistics());
}
