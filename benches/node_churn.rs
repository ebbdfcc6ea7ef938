use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use smallfree::{HeapSource, SmallFreeList};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// smallfree alloc/free churn on a pre-inserted pool.
fn smallfree_churn(list: &mut SmallFreeList) {
  for _ in 0..OPS {
    unsafe {
      let ptr = list.allocate();
      black_box(ptr);
      list.deallocate(ptr);
    }
  }
}

/// libc alloc/free churn at the same node size.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_node_churn(c: &mut Criterion) {
  let mut group = c.benchmark_group("node_churn");

  for size in [16usize, 32, 64, 128] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("smallfree", size), &size, |b, &size| {
      let bytes = size * 255 * 4;
      let mem = HeapSource::allocate_region(bytes, 16);
      assert!(!mem.is_null());
      let mut list = unsafe { SmallFreeList::with_memory(size, mem, bytes) };
      b.iter(|| smallfree_churn(&mut list));
      drop(list);
      unsafe { HeapSource::release_region(mem, bytes, 16) };
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_node_churn);
criterion_main!(benches);
