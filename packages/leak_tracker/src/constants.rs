// A poisoned lock means a reporting callback or registry operation panicked mid-update.
// The registry can no longer be trusted to match the live allocations, so we panic too.
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - the allocation registry \
    can no longer be trusted to reflect the live allocations";
