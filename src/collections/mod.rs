//! `collections` contains concurrent datastructures, that can be used with
//! transactions.

mod list;
mod queue;

pub use self::{
    list::{Iter, List},
    queue::Queue,
};
