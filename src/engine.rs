// =====================================================
// DATABASE ENGINES
// One DbEngine implementation per reachable backend.
// =====================================================

pub mod postgres;
