use memcheck::{ObjectId, registry};
use tracing::info;

type AnyResult<T> = Result<T, String>;

/// The tracked type: reports itself from its constructor and destructor.
struct Foo {
    payload: [u64; 2],
}

impl Foo {
    fn new() -> Box<Foo> {
        let foo = Box::new(Foo { payload: [0; 2] });
        registry::<Foo>().track_created(&*foo);
        foo
    }
}

impl Drop for Foo {
    fn drop(&mut self) {
        registry::<Foo>().track_destroyed(self);
    }
}

// Creating and destroying outside `run` gives the traces a few more frames.
#[inline(never)]
fn create_foo() -> Box<Foo> {
    Foo::new()
}

#[inline(never)]
fn destroy_foo(foo: Box<Foo>) {
    drop(foo);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> AnyResult<()> {
    let foos = registry::<Foo>();

    let a = create_foo();
    let b = create_foo(); // leaked on purpose
    let a_id = ObjectId::of(&*a);
    let b_id = ObjectId::of(&*b);
    info!(payload = a.payload.len() + b.payload.len(), "created two objects");

    println!("a exists: {}", foos.exists(a_id));
    expect(foos.exists(a_id) && foos.exists(b_id), "both objects should be alive")?;

    destroy_foo(a);
    println!("a exists: {}", foos.exists(a_id));
    expect(!foos.exists(a_id), "a should be dead after destruction")?;
    expect(foos.exists(b_id), "b should still be alive")?;
    println!();

    foos.show_create(a_id);
    println!();

    foos.show_destroy(a_id);
    println!();

    // Never happened, so this goes to stderr.
    foos.show_destroy(b_id);
    println!();

    foos.show_objs(false);
    println!();

    let report = foos.leak_report();
    expect(report.ids() == vec![b_id], "only b should be reported as leaked")?;
    print!("{report}");

    std::mem::forget(b);
    Ok(())
}

fn expect(condition: bool, message: &str) -> AnyResult<()> {
    if condition {
        Ok(())
    } else {
        Err(format!("invariant violated: {message}"))
    }
}
