// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

mod event;
mod mutex;
mod pool;

pub use self::{
    event::Event,
    mutex::Mutex,
    pool::Pool,
};
