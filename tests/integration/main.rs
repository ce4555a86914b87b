mod mock_provider;
mod fallback;
