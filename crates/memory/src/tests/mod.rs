mod bus;
mod proptest_alloc;
