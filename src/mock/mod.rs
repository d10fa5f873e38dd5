pub mod mock_stream;
