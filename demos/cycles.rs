use tgc::{Gc, Trace, Visitor};

struct Person {
    name: String,
    friend: Gc<Person>,
}

unsafe impl Trace for Person {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_handle(&self.friend);
    }
}

impl Drop for Person {
    fn drop(&mut self) {
        println!("{} is collected", self.name);
    }
}

fn person(name: &str) -> Gc<Person> {
    tgc::allocate(Person {
        name: name.to_string(),
        friend: Gc::empty(tgc::global_heap()),
    })
}

fn main() {
    let alice = person("alice");
    let bob = person("bob");
    alice.friend.set(&bob);
    bob.friend.set(&alice);

    let carol = person("carol");
    carol.friend.set(&carol);

    drop((bob, carol));
    println!("alice keeps bob alive");
    for _ in 0..4 {
        tgc::collect(2);
    }
    println!("{}", tgc::global_heap().statistics());

    drop(alice);
    while tgc::global_heap().statistics().metas > 0 {
        tgc::collect(2);
    }
    println!("{}", tgc::global_heap().statistics());
    tgc::teardown();
}
