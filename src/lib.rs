//! Chunked free list for pools of small, fixed-size nodes.
//!
//! The list carves donated memory regions into chunks of at most 255 nodes
//! and keeps its bookkeeping almost entirely inside the free nodes
//! themselves: one byte per free node, linking to the next free slot of the
//! same chunk. It is a building block for allocator stacks, not a
//! general-purpose allocator.

use core::{
  mem,
  ptr::null_mut,
  sync::atomic::{AtomicPtr, Ordering},
};

// =============================================================================
// Constants
// =============================================================================

/// Free-chain links are single bytes and `node_count` itself must stay a
/// valid out-of-range sentinel, so a chunk never holds more than 255 nodes.
const CHUNK_MAX_NODES: usize = u8::MAX as usize;

/// Registry slot of the ring sentinel.
const DUMMY: ChunkId = 0;

/// "No chunk" marker for the unused stack.
const NIL: ChunkId = ChunkId::MAX;

const PAGE_SIZE: usize = 4096;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(CHUNK_MAX_NODES == 255);
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(DUMMY != NIL);

// =============================================================================
// Types
// =============================================================================

/// Stable index of a chunk in the registry.
type ChunkId = usize;

/// Per-chunk bookkeeping. Lives in the registry, not in donated memory;
/// `base` points at the chunk's node storage.
struct Chunk {
  base: *mut u8,
  /// Head of the embedded free chain. Meaningless while `capacity == 0`.
  first_free: u8,
  /// Node slots this chunk was carved into. Fixed at creation.
  node_count: u8,
  /// Currently-free nodes, `0..=node_count`.
  capacity: u8,
  /// Ring link. Doubles as the next-unused link while the chunk sits on
  /// the unused stack.
  prev: ChunkId,
  next: ChunkId,
}

/// Contract checks are debug-only unless the `strict` feature keeps them in
/// release builds. Violations are caller bugs, not recoverable errors.
macro_rules! contract {
  ($cond:expr, $($arg:tt)+) => {
    if cfg!(any(debug_assertions, feature = "strict")) {
      assert!($cond, $($arg)+);
    }
  };
}

// =============================================================================
// Small Free List
// =============================================================================

/// Free list over fixed-size nodes, fed by raw memory regions.
///
/// All nodes served by one instance share `node_size`. The instance never
/// owns the donated regions; it only assumes exclusive logical access to
/// them for its lifetime. Single-threaded by design: the type holds raw
/// pointers and is neither `Send` nor `Sync`.
pub struct SmallFreeList {
  /// Chunk registry; slot 0 is the ring sentinel. Entries are never removed.
  chunks: Vec<Chunk>,
  /// Allocation cursor. Always a registry slot of this instance.
  alloc_chunk: ChunkId,
  /// Cursor for the deallocate ownership search.
  dealloc_chunk: ChunkId,
  /// Head of the unused stack, `NIL` when empty.
  unused_chunk: ChunkId,
  node_size: usize,
  /// Free nodes across all chunks, active and unused.
  capacity: usize,
}

impl SmallFreeList {
  /// Creates an empty list serving nodes of `node_size` bytes.
  ///
  /// # Panics
  /// Panics if `node_size` is zero; a free node must hold one link byte.
  pub fn new(node_size: usize) -> Self {
    assert!(node_size >= 1, "node_size must be at least one byte");
    Self {
      chunks: vec![Chunk {
        base: null_mut(),
        first_free: 0,
        node_count: 0,
        capacity: 0,
        prev: DUMMY,
        next: DUMMY,
      }],
      alloc_chunk: DUMMY,
      dealloc_chunk: DUMMY,
      unused_chunk: NIL,
      node_size,
      capacity: 0,
    }
  }

  /// Creates a list and donates an initial region to it.
  ///
  /// # Safety
  /// Same contract as [`SmallFreeList::insert`].
  pub unsafe fn with_memory(node_size: usize, memory: *mut u8, size: usize) -> Self {
    let mut list = Self::new(node_size);
    unsafe { list.insert(memory, size) };
    list
  }

  /// Number of free nodes across every chunk, active or not.
  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Fixed node size of this instance.
  #[inline]
  pub fn node_size(&self) -> usize {
    self.node_size
  }

  /// Donates `size` bytes at `memory` to the list.
  ///
  /// The region is carved into full 255-node chunks plus one remainder
  /// chunk of `(size % unit) / node_size` nodes. Every chunk goes onto the
  /// unused stack and is activated lazily, only when the active ring cannot
  /// satisfy an allocation.
  ///
  /// # Safety
  /// `memory..memory + size` must be a single contiguous writable region,
  /// not handed to any other list, aligned for the node type it will back,
  /// and must outlive this instance. Sizing and alignment are the caller's
  /// responsibility and are not validated here.
  pub unsafe fn insert(&mut self, memory: *mut u8, size: usize) {
    let chunk_unit = self.node_size * CHUNK_MAX_NODES;
    let full_chunks = size / chunk_unit;
    let mut mem = memory;
    for _ in 0..full_chunks {
      let id = unsafe { self.new_chunk(mem, CHUNK_MAX_NODES as u8) };
      self.push_unused(id);
      mem = unsafe { mem.add(chunk_unit) };
    }
    let remainder_nodes = (size % chunk_unit) / self.node_size;
    if remainder_nodes > 0 {
      let id = unsafe { self.new_chunk(mem, remainder_nodes as u8) };
      self.push_unused(id);
    }
    self.capacity += full_chunks * CHUNK_MAX_NODES + remainder_nodes;
  }

  /// Pops one node off the allocation chunk's free chain.
  ///
  /// # Safety
  /// `capacity()` must be at least 1. The returned pointer is valid for
  /// `node_size` bytes until handed back via [`SmallFreeList::deallocate`].
  pub unsafe fn allocate(&mut self) -> *mut u8 {
    contract!(self.capacity >= 1, "allocate called with no free nodes");
    if self.chunks[self.alloc_chunk].capacity == 0 {
      let found = self.find_chunk(1);
      contract!(
        found,
        "no chunk with a free node despite capacity {}",
        self.capacity
      );
    }
    let node_size = self.node_size;
    let chunk = &mut self.chunks[self.alloc_chunk];
    let node = unsafe { chunk.base.add(chunk.first_free as usize * node_size) };
    chunk.first_free = unsafe { *node };
    chunk.capacity -= 1;
    self.capacity -= 1;
    node
  }

  /// Returns `node` to the chunk that owns it.
  ///
  /// The owner is looked up starting at the deallocation cursor, then by
  /// walking the active ring forward and backward in lockstep. Consecutive
  /// frees tend to hit the cached cursor or a near neighbor, so the walk is
  /// sub-linear amortized. The owner becomes the new cursor.
  ///
  /// # Safety
  /// `node` must have come from [`SmallFreeList::allocate`] on this same
  /// instance and not have been deallocated since. There is no double-free
  /// detection.
  pub unsafe fn deallocate(&mut self, node: *mut u8) {
    if !self.owns(self.dealloc_chunk, node) {
      let start = self.dealloc_chunk;
      let mut fwd = self.chunks[start].next;
      let mut back = self.chunks[start].prev;
      while fwd != start || back != start {
        if self.owns(fwd, node) {
          self.dealloc_chunk = fwd;
          break;
        }
        if self.owns(back, node) {
          self.dealloc_chunk = back;
          break;
        }
        fwd = self.chunks[fwd].next;
        back = self.chunks[back].prev;
      }
    }
    contract!(
      self.owns(self.dealloc_chunk, node),
      "deallocate of a pointer this list never handed out: {:p}",
      node
    );
    let node_size = self.node_size;
    let chunk = &mut self.chunks[self.dealloc_chunk];
    unsafe { *node = chunk.first_free };
    let offset = node as usize - chunk.base as usize;
    contract!(
      offset % node_size == 0,
      "pointer {:p} is not on a node boundary",
      node
    );
    chunk.first_free = (offset / node_size) as u8;
    chunk.capacity += 1;
    self.capacity += 1;
  }

  /// Makes the allocation cursor point at a chunk with at least `n` free
  /// nodes.
  ///
  /// Preference order: the cursor chunk itself, then a fresh chunk popped
  /// off the unused stack (spliced before the sentinel, keeping the common
  /// case O(1)), then a bidirectional ring walk from the deallocation
  /// cursor. Returns `false` only when the walk exhausts the ring, which
  /// cannot happen while the `capacity` bookkeeping holds; `allocate`
  /// treats that as a fatal contract violation.
  fn find_chunk(&mut self, n: usize) -> bool {
    debug_assert!(self.capacity >= n && n <= CHUNK_MAX_NODES);
    if self.chunks[self.alloc_chunk].capacity as usize >= n {
      return true;
    }
    if self.unused_chunk != NIL {
      let id = self.unused_chunk;
      self.unused_chunk = self.chunks[id].prev;
      self.activate(id);
      self.alloc_chunk = id;
      return true;
    }
    let start = self.dealloc_chunk;
    if self.chunks[start].capacity as usize >= n {
      self.alloc_chunk = start;
      return true;
    }
    let mut fwd = self.chunks[start].next;
    let mut back = self.chunks[start].prev;
    while fwd != start || back != start {
      if self.chunks[fwd].capacity as usize >= n {
        self.alloc_chunk = fwd;
        return true;
      }
      if self.chunks[back].capacity as usize >= n {
        self.alloc_chunk = back;
        return true;
      }
      fwd = self.chunks[fwd].next;
      back = self.chunks[back].prev;
    }
    false
  }

  /// Carves `node_count` node slots out of `base` and registers the chunk.
  ///
  /// Writes the embedded free chain: slot `i` links to `i + 1`, so the last
  /// slot of a full chunk holds the out-of-range sentinel 255. The sentinel
  /// is never followed because `capacity` reaches zero on the same pop.
  unsafe fn new_chunk(&mut self, base: *mut u8, node_count: u8) -> ChunkId {
    let id = self.chunks.len();
    self.chunks.push(Chunk {
      base,
      first_free: 0,
      node_count,
      capacity: node_count,
      prev: NIL,
      next: NIL,
    });
    let mut slot = base;
    for i in 0..node_count {
      unsafe { *slot = i + 1 };
      slot = unsafe { slot.add(self.node_size) };
    }
    id
  }

  fn push_unused(&mut self, id: ChunkId) {
    self.chunks[id].prev = self.unused_chunk;
    self.unused_chunk = id;
  }

  /// Splices `id` into the active ring immediately before the sentinel.
  fn activate(&mut self, id: ChunkId) {
    let tail = self.chunks[DUMMY].prev;
    self.chunks[id].prev = tail;
    self.chunks[id].next = DUMMY;
    self.chunks[tail].next = id;
    self.chunks[DUMMY].prev = id;
  }

  /// Address-range ownership test: `node` falls inside `id`'s storage.
  /// Always false for the sentinel, whose range is empty.
  #[inline]
  fn owns(&self, id: ChunkId, node: *mut u8) -> bool {
    let chunk = &self.chunks[id];
    let start = chunk.base as usize;
    let addr = node as usize;
    addr >= start && addr < start + self.node_size * chunk.node_count as usize
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Backing Region Source
// =============================================================================

/// Called when the region source runs dry. Should release memory somewhere
/// and return `true` to retry the mapping, or `false` to give up.
pub type OutOfMemoryHook = fn(size: usize) -> bool;

static OOM_HOOK: AtomicPtr<()> = AtomicPtr::new(null_mut());

/// Installs `hook` as the global out-of-memory hook, returning the previous
/// one. Pass `None` to clear it.
pub fn set_out_of_memory_hook(hook: Option<OutOfMemoryHook>) -> Option<OutOfMemoryHook> {
  let raw = match hook {
    Some(f) => f as *mut (),
    None => null_mut(),
  };
  let prev = OOM_HOOK.swap(raw, Ordering::AcqRel);
  if prev.is_null() {
    None
  } else {
    // Only ever stores OutOfMemoryHook values, so the round-trip is sound.
    Some(unsafe { mem::transmute::<*mut (), OutOfMemoryHook>(prev) })
  }
}

fn out_of_memory_hook() -> Option<OutOfMemoryHook> {
  let raw = OOM_HOOK.load(Ordering::Acquire);
  if raw.is_null() {
    None
  } else {
    Some(unsafe { mem::transmute::<*mut (), OutOfMemoryHook>(raw) })
  }
}

/// Stateless source of raw regions for a growth-policy layer to feed into
/// [`SmallFreeList::insert`]. The free list core never calls it; regions
/// are released whole when the owning arena is torn down, never per node.
pub struct HeapSource;

impl HeapSource {
  /// Maps a fresh region of at least `size` bytes, rounded up to whole
  /// pages. On mapping failure the out-of-memory hook is retried until it
  /// declines; returns null when it does (or when no hook is set).
  ///
  /// `align` must be a power of two no larger than a page.
  pub fn allocate_region(size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);
    let size = align_up(size.max(1), PAGE_SIZE);
    loop {
      let ptr = unsafe { os_mmap(size) };
      if !ptr.is_null() {
        return ptr;
      }
      match out_of_memory_hook() {
        Some(hook) if hook(size) => continue,
        _ => return null_mut(),
      }
    }
  }

  /// Unmaps a region.
  ///
  /// # Safety
  /// `ptr` and `size` must describe exactly one region previously returned
  /// by [`HeapSource::allocate_region`], with no live nodes inside it.
  pub unsafe fn release_region(ptr: *mut u8, size: usize, align: usize) {
    debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);
    unsafe { os_munmap(ptr, align_up(size.max(1), PAGE_SIZE)) };
  }

  /// Largest region a single mapping can provide.
  pub fn max_region_size() -> usize {
    isize::MAX as usize
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
impl SmallFreeList {
  /// Verifies cursor, ring, stack, chain, and counter invariants.
  fn check_invariants(&self) {
    assert!(
      self.alloc_chunk < self.chunks.len(),
      "alloc cursor out of registry"
    );
    assert!(
      self.dealloc_chunk < self.chunks.len(),
      "dealloc cursor out of registry"
    );

    // The ring closes and every forward link has a matching back link.
    let mut id = DUMMY;
    let mut seen = 0;
    loop {
      let next = self.chunks[id].next;
      assert_eq!(self.chunks[next].prev, id, "ring links out of sync at {id}");
      id = next;
      seen += 1;
      assert!(seen <= self.chunks.len(), "ring does not close");
      if id == DUMMY {
        break;
      }
    }

    // The unused stack terminates.
    let mut unused = 0;
    let mut id = self.unused_chunk;
    while id != NIL {
      unused += 1;
      assert!(unused < self.chunks.len(), "unused stack cycles");
      id = self.chunks[id].prev;
    }

    // Total capacity is the sum over all chunks, and each chunk's chain has
    // exactly `capacity` in-range links.
    let mut total = 0;
    for chunk in &self.chunks {
      assert!(chunk.capacity <= chunk.node_count);
      total += chunk.capacity as usize;
      let mut link = chunk.first_free;
      for _ in 0..chunk.capacity {
        assert!(link < chunk.node_count, "free chain link out of range");
        link = unsafe { *chunk.base.add(link as usize * self.node_size) };
      }
    }
    assert_eq!(total, self.capacity, "capacity counter out of sync");
  }

  /// Chunks currently spliced into the active ring.
  fn active_chunks(&self) -> usize {
    let mut count = 0;
    let mut id = self.chunks[DUMMY].next;
    while id != DUMMY {
      count += 1;
      id = self.chunks[id].next;
    }
    count
  }
}
