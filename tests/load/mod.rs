mod stress_test;
