use anyhow::Result;

// Heap accounting for the memory budget of sandboxed processes.
#[global_allocator]
static ALLOC: plugbox::warden::WardenAllocator = plugbox::warden::WardenAllocator;

fn main() -> Result<()> {
    plugbox::cli::run()
}
